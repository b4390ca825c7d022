//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 客户端对调用方同步暴露的失败只有两类：寻址错误（部署/设备未知）与尺寸超限；
//!   连接层面的瞬时故障全部在反应器内部消化，不会出现在这里；
//! - 另有启动期错误（配置非法、反应器线程无法创建），它们发生在任何连接之前。
//!
//! ## 设计要求（What）
//! - 所有变体派生 `thiserror::Error`，携带可读上下文；
//! - [`ClientError::code`] 提供稳定错误码，命名沿用 `backlog.client.*` 前缀。

use std::io;

use backlog_codec::FrameError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::routing::DeviceId;

/// 客户端错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“调用方可修正”的请求错误与“环境导致”的启动错误，帮助上层决定是否重试；
/// - **契约 (What)**：
///   - 寻址与尺寸错误在任何字节入队之前返回，不留下部分状态；
///   - 变体均为 `Send + Sync + 'static`，可跨线程传播；
/// - **风险 (Trade-offs)**：部署名以 `String` 保存，错误路径上多一次分配，换取日志可读性。
#[derive(Debug, Error)]
pub enum ClientError {
    /// 路由表中没有任何属于该部署的设备。
    #[error("deployment `{deployment}` is not connected or does not exist")]
    UnknownDeployment { deployment: String },

    /// 部署存在，但指定设备号未登记。
    #[error("device id {device_id} is not connected or does not exist for deployment `{deployment}`")]
    UnknownDevice {
        deployment: String,
        device_id: DeviceId,
    },

    /// 监听者未注册（或已注销）。
    #[error("core station `{station}` is not registered")]
    NotRegistered { station: String },

    /// 通配设备号只能用于广播发送，不能登记为具体设备。
    #[error("device id {device_id} is reserved for broadcast and cannot be routed")]
    ReservedDeviceId { device_id: DeviceId },

    /// 负载分帧失败（目前仅有尺寸超限）。
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// 配置非法或无法读取。
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 反应器或定时线程无法启动。
    #[error("failed to start {component}: {source}")]
    Startup {
        component: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::UnknownDeployment { .. } => "backlog.client.unknown_deployment",
            ClientError::UnknownDevice { .. } => "backlog.client.unknown_device",
            ClientError::NotRegistered { .. } => "backlog.client.not_registered",
            ClientError::ReservedDeviceId { .. } => "backlog.client.reserved_device_id",
            ClientError::Frame(inner) => inner.code(),
            ClientError::Config(_) => "backlog.client.invalid_config",
            ClientError::Startup { .. } => "backlog.client.startup_failed",
        }
    }

    /// 同样的请求稍后重试是否可能成功。
    ///
    /// 寻址错误在设备登记后即可恢复，因此视为可重试；尺寸与配置错误需要调用方修改输入。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::UnknownDeployment { .. }
                | ClientError::UnknownDevice { .. }
                | ClientError::Startup { .. }
        )
    }

    pub(crate) fn startup(component: &'static str, source: io::Error) -> Self {
        ClientError::Startup { component, source }
    }
}
