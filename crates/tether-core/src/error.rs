//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为连接生命周期引擎提供集中定义的错误域，覆盖建连、发送、接收、套接字故障与资源耗尽；
//! - 每个变体都映射到稳定错误码（`tether.*`），便于日志与告警按码聚合。
//!
//! ## 传播策略（What）
//! - 建连错误同步返回给 `connect` 调用方；
//! - 发送错误只记录日志并触发关闭，不返回给 `send` 调用方；
//! - [`TetherError::ReceiveRecoverable`] 在接收泵内部被吸收：清空接收缓冲后继续读取；
//! - 关闭路径上的错误只记录，永不抛出。

use std::fmt;

use thiserror::Error;

/// crate 内统一的 `Result` 别名。
pub type Result<T, E = TetherError> = core::result::Result<T, E>;

/// 连接生命周期引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把不同层次的失败合流为一个枚举，调用方既能 `match` 细分语义，
///   也能通过 [`TetherError::code`] 拿到机读错误码。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可以跨任务传播；
///   - [`TetherError::is_connection_fatal`] 为 `true` 的错误必然导致连接走关闭路径；
///   - `SocketFault`/`Setup` 的 `code` 字段由传输实现层按操作类型填充。
/// - **设计权衡 (Trade-offs)**：消息以 `String` 保存，放弃零分配换取可读性。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TetherError {
    /// 建连超时，或底层连接调用失败（地址、参数、套接字错误统一包装）。
    #[error("connect failed: {message}")]
    ConnectFailed { message: String },

    /// 在没有已建立套接字的状态上尝试发送。
    #[error("connection is not established")]
    Disconnected,

    /// 报文序列化或写入失败。
    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    /// 处理接收数据时出现的可恢复错误，永不关闭连接。
    #[error("receive handler failed: {reason}")]
    ReceiveRecoverable { reason: String },

    /// 零字节读取或传输层错误，必然终止连接。
    #[error("{operation}: {message}")]
    SocketFault {
        code: &'static str,
        operation: &'static str,
        message: String,
    },

    /// 监听、绑定、接受或套接字选项配置阶段的失败。
    #[error("{operation}: {message}")]
    Setup {
        code: &'static str,
        operation: &'static str,
        message: String,
    },

    /// I/O 上下文池在 `Fail` 策略下耗尽。
    #[error("io context pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// 引擎已经进入终态，不能再次启动。
    #[error("engine has been stopped")]
    EngineStopped,

    /// 配置解析或校验失败。
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl TetherError {
    /// 构造一个接收期可恢复错误，通常由 `on_received` 回调返回。
    pub fn recoverable(reason: impl fmt::Display) -> Self {
        TetherError::ReceiveRecoverable {
            reason: reason.to_string(),
        }
    }

    /// 构造一个发送失败错误。
    pub fn send_failed(reason: impl fmt::Display) -> Self {
        TetherError::SendFailed {
            reason: reason.to_string(),
        }
    }

    /// 构造建连失败错误，保留原始错误文案。
    pub fn connect_failed(message: impl fmt::Display) -> Self {
        TetherError::ConnectFailed {
            message: message.to_string(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TetherError::ConnectFailed { .. } => codes::CONNECT_FAILED,
            TetherError::Disconnected => codes::DISCONNECTED,
            TetherError::SendFailed { .. } => codes::SEND_FAILED,
            TetherError::ReceiveRecoverable { .. } => codes::RECEIVE_RECOVERABLE,
            TetherError::SocketFault { code, .. } | TetherError::Setup { code, .. } => code,
            TetherError::PoolExhausted { .. } => codes::POOL_EXHAUSTED,
            TetherError::EngineStopped => codes::ENGINE_STOPPED,
            TetherError::Config { .. } => codes::CONFIG_INVALID,
        }
    }

    /// 该错误发生在一条活跃连接上时，是否必须关闭连接。
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::Disconnected
                | TetherError::SendFailed { .. }
                | TetherError::SocketFault { .. }
        )
    }
}

/// 稳定错误码常量。
pub mod codes {
    pub const CONNECT_FAILED: &str = "tether.transport.connect_failed";
    pub const DISCONNECTED: &str = "tether.transport.disconnected";
    pub const SEND_FAILED: &str = "tether.transport.send_failed";
    pub const RECEIVE_RECOVERABLE: &str = "tether.transport.receive_recoverable";
    pub const POOL_EXHAUSTED: &str = "tether.pool.exhausted";
    pub const ENGINE_STOPPED: &str = "tether.engine.stopped";
    pub const CONFIG_INVALID: &str = "tether.config.invalid";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_close_the_connection() {
        assert!(TetherError::Disconnected.is_connection_fatal());
        assert!(TetherError::send_failed("broken pipe").is_connection_fatal());
        assert!(
            TetherError::SocketFault {
                code: "tether.transport.tcp.read_failed",
                operation: "tcp read",
                message: "reset".into(),
            }
            .is_connection_fatal()
        );
        assert!(!TetherError::recoverable("bad frame").is_connection_fatal());
        assert!(!TetherError::connect_failed("timed out").is_connection_fatal());
    }

    #[test]
    fn codes_follow_variant() {
        assert_eq!(TetherError::Disconnected.code(), codes::DISCONNECTED);
        assert_eq!(
            TetherError::PoolExhausted { capacity: 2 }.code(),
            codes::POOL_EXHAUSTED
        );
        let fault = TetherError::Setup {
            code: "tether.transport.tcp.bind_failed",
            operation: "tcp bind",
            message: "address in use".into(),
        };
        assert_eq!(fault.code(), "tether.transport.tcp.bind_failed");
        assert_eq!(fault.to_string(), "tcp bind: address in use");
    }

    #[test]
    fn connect_failed_keeps_underlying_message() {
        let err = TetherError::connect_failed("Connection refused (os error 111)");
        assert_eq!(
            err.to_string(),
            "connect failed: Connection refused (os error 111)"
        );
    }
}
