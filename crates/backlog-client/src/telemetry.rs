//! 全局 `tracing` Subscriber 安装入口（`telemetry` 特性）。
//!
//! 库代码只负责发出结构化事件；是否输出、输出到哪里由宿主决定。宿主没有自己的订阅器时，
//! 可以调用 [`init_tracing`] 获得一个 `fmt + EnvFilter` 组合。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

/// 安装订阅器失败。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter directive: {0}")]
    InvalidFilter(#[from] ParseError),

    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    #[error("failed to install the global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局订阅器。
///
/// # 教案式说明
/// - **意图 (Why)**：诊断探针与宿主测试需要一行代码拿到带线程名的结构化日志，反应器与重连线程的
///   事件因此可以按线程区分；
/// - **契约 (What)**：
///   - `directives` 为 `Some` 时按 `EnvFilter` 语法解析，解析失败返回 [`TelemetryError::InvalidFilter`]；
///   - 为 `None` 时读取 `RUST_LOG`，缺省为 `info`；
///   - 进程内只能成功一次，之后返回 [`TelemetryError::SubscriberAlreadySet`]；
/// - **执行 (How)**：`registry + EnvFilter + fmt` 三层组合，设置为全局默认。
pub fn init_tracing(directives: Option<&str>) -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let filter = build_env_filter(directives)?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(directives: Option<&str>) -> Result<EnvFilter, ParseError> {
    match directives {
        Some(directives) => EnvFilter::try_new(directives),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}
