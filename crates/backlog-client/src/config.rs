//! 客户端配置。
//!
//! 配置在构造 [`CoreStationClient`](crate::CoreStationClient) 时固定下来，运行期不可变：
//! 重连延迟与包上限是进程级常量，所有连接共享。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backlog_codec::{DEFAULT_MAX_PAYLOAD_SIZE, LENGTH_PREFIX_LEN};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_RECONNECT_DELAY_MS: u64 = 30_000;
const DEFAULT_EVENTS_CAPACITY: usize = 256;
/// 每条连接按 `2 * (负载上限 + 4)` 预留读写缓冲，上限用于约束单连接内存。
const MAX_PAYLOAD_CEILING: usize = 16 * 1024 * 1024;

/// 配置读取或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: `{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 客户端运行参数。
///
/// # 教案式说明
/// - **意图 (Why)**：把重连节奏、包上限与轮询批量集中在一处，既可代码构造也可从 TOML 加载；
/// - **契约 (What)**：
///   - `reconnect_delay_ms`：连接失败到下一次注册尝试之间的固定延迟，必须为正；
///   - `max_payload_size`：单条负载上限，分帧后的包上限为其加 4；
///   - `events_capacity`：每次轮询最多取回的就绪事件数；
/// - **风险 (Trade-offs)**：延迟为固定值而非指数退避，与核心站侧的会话超时保持可预测的对应关系。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub reconnect_delay_ms: u64,
    pub max_payload_size: usize,
    pub events_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn with_events_capacity(mut self, events_capacity: usize) -> Self {
        self.events_capacity = events_capacity;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// 长度前缀 + 负载的上限（转义前）。
    pub fn max_packet_size(&self) -> usize {
        self.max_payload_size.saturating_add(LENGTH_PREFIX_LEN)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect_delay_ms",
                reason: "must be a positive number of milliseconds",
            });
        }
        if self.max_payload_size == 0 || self.max_payload_size > MAX_PAYLOAD_CEILING {
            return Err(ConfigError::Invalid {
                field: "max_payload_size",
                reason: "must be between 1 byte and 16 MiB",
            });
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "events_capacity",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
