//! # config 模块说明
//!
//! ## 意图（Why）
//! - 把保活参数、池容量、监听 backlog、接收缓冲大小与建连超时集中为显式配置，
//!   避免实现层散落魔法数字；
//! - 同时支持 Builder 风格的代码配置与 TOML 文本加载，时长字段统一以毫秒表达。
//!
//! ## 契约（What）
//! - 所有配置均实现 `Default`，默认值与引擎历史行为一致：
//!   保活 5000ms/1000ms、池容量 5000、backlog 200、建连超时 5000ms；
//! - `from_toml_str` 解析后立即执行 `validate`，失败返回 [`TetherError::Config`]。

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TetherError};

/// 默认的 I/O 上下文池容量。
pub const DEFAULT_POOL_CAPACITY: usize = 5000;
/// 监听队列长度。
pub const DEFAULT_BACKLOG: u32 = 200;
/// 每个 I/O 上下文持有的固定接收缓冲大小。
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
/// 首个保活探测前的空闲时长。
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_millis(5000);
/// 保活探测间隔。
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);
/// `connect` 的默认等待上限。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// `is_connected` 可读性探测的等待上限。
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// 保活控制块的字节长度：三个小端 `u32`。
pub const KEEPALIVE_CONTROL_BLOCK_LEN: usize = 12;

/// TCP 保活参数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接建立后（接受与主动建连两条路径）立即启用保活，尽早发现静默断开的对端。
///
/// ## 契约 (What)
/// - [`control_block`](Self::control_block) 产出逐位固定的 12 字节控制块：
///   `OnOff`、`KeepAliveTime`(ms)、`KeepAliveInterval`(ms)，均为小端 `u32`；
/// - 超出 `u32::MAX` 毫秒的时长在控制块中饱和截断。
///
/// ## 注意事项 (Trade-offs)
/// - 控制块格式面向 Windows 的 `SIO_KEEPALIVE_VALS`；其他平台由实现层
///   映射为可移植的 `SO_KEEPALIVE`/`TCP_KEEPIDLE`/`TCP_KEEPINTVL`，数值保持一致。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    #[serde(rename = "time_ms", with = "millis")]
    pub time: Duration,
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: DEFAULT_KEEPALIVE_TIME,
            interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl KeepAliveConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_time(mut self, time: Duration) -> Self {
        self.time = time;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn control_block(&self) -> [u8; KEEPALIVE_CONTROL_BLOCK_LEN] {
        let mut block = [0u8; KEEPALIVE_CONTROL_BLOCK_LEN];
        block[0..4].copy_from_slice(&u32::from(self.enabled).to_le_bytes());
        block[4..8].copy_from_slice(&saturating_millis(self.time).to_le_bytes());
        block[8..12].copy_from_slice(&saturating_millis(self.interval).to_le_bytes());
        block
    }
}

fn saturating_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// 上下文池耗尽时的处理策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// 立即失败，返回 [`TetherError::PoolExhausted`]。
    #[default]
    Fail,
    /// 等待其他连接归还上下文。
    Wait,
}

/// 服务端引擎配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub pool_capacity: usize,
    pub backlog: u32,
    pub receive_buffer_size: usize,
    pub exhaustion: ExhaustionPolicy,
    pub keepalive: KeepAliveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            backlog: DEFAULT_BACKLOG,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            exhaustion: ExhaustionPolicy::Fail,
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion = policy;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(invalid("pool_capacity must be greater than zero"));
        }
        if self.backlog == 0 {
            return Err(invalid("backlog must be greater than zero"));
        }
        if self.receive_buffer_size == 0 {
            return Err(invalid("receive_buffer_size must be greater than zero"));
        }
        Ok(())
    }

    /// 从 TOML 文本加载配置，缺省字段取默认值。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| invalid(err.message()))?;
        config.validate()?;
        Ok(config)
    }
}

/// 客户端引擎配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    pub receive_buffer_size: usize,
    pub keepalive: KeepAliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.receive_buffer_size == 0 {
            return Err(invalid("receive_buffer_size must be greater than zero"));
        }
        if self.probe_timeout > Duration::from_secs(1) {
            return Err(invalid("probe_timeout must not exceed one second"));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| invalid(err.message()))?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(reason: impl Into<String>) -> TetherError {
    TetherError::Config {
        reason: reason.into(),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
