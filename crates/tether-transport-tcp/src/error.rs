use std::io;

use tether_core::TetherError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "tether.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "tether.transport.tcp.listen_failed",
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "tether.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "tether.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "tether.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const PEER_CLOSED: OperationKind = OperationKind {
    code: "tether.transport.tcp.peer_closed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "tether.transport.tcp.write_failed",
    message: "tcp write",
};

/// 将建立阶段（绑定/监听/接受/配置）的 IO 错误映射为 [`TetherError::Setup`]。
pub(crate) fn map_setup_error(kind: OperationKind, error: io::Error) -> TetherError {
    TetherError::Setup {
        code: kind.code,
        operation: kind.message,
        message: error.to_string(),
    }
}

/// 将连接期读写的 IO 错误映射为 [`TetherError::SocketFault`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TetherError {
    TetherError::SocketFault {
        code: kind.code,
        operation: kind.message,
        message: error.to_string(),
    }
}

/// 对端有序关闭（读到零字节）。
pub(crate) fn peer_closed() -> TetherError {
    TetherError::SocketFault {
        code: PEER_CLOSED.code,
        operation: PEER_CLOSED.message,
        message: "peer closed the connection".to_owned(),
    }
}

/// 写失败统一归入发送错误，保留操作码以便日志聚合。
pub(crate) fn map_write_error(error: io::Error) -> TetherError {
    TetherError::SendFailed {
        reason: format!("{} ({}): {}", WRITE.message, WRITE.code, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_and_fault_keep_operation_codes() {
        let err = map_setup_error(BIND, io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(err.code(), BIND.code);
        assert!(!err.is_connection_fatal());

        let err = map_io_error(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.code(), READ.code);
        assert!(err.is_connection_fatal());

        assert_eq!(peer_closed().code(), PEER_CLOSED.code);
    }

    #[test]
    fn write_errors_are_send_failures() {
        let err = map_write_error(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, TetherError::SendFailed { .. }));
        assert!(err.to_string().contains(WRITE.code));
    }
}
