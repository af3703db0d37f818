//! 出站报文契约。
//!
//! 引擎不定义任何应用层线协议：它只要求出站单元能被序列化为一段字节，
//! 随后原样写入套接字。帧边界、加密与版本协商都属于调用方。

use bytes::Bytes;

use crate::error::{Result, TetherError};

/// 可序列化为线上字节序列的出站单元。
///
/// # 契约（What）
/// - `encode` 返回本次要写入套接字的完整字节；返回错误时引擎按
///   [`TetherError::SendFailed`] 处理并关闭连接；
/// - 实现必须是 `Send + Sync`：发送发生在异步任务中，报文引用会跨越 `.await`。
pub trait Packet: Send + Sync {
    fn encode(&self) -> Result<Bytes>;
}

/// 已经编码好的原始字节报文。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawPacket(Bytes);

impl RawPacket {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Packet for RawPacket {
    fn encode(&self) -> Result<Bytes> {
        Ok(self.0.clone())
    }
}

impl Packet for Bytes {
    fn encode(&self) -> Result<Bytes> {
        Ok(self.clone())
    }
}

impl Packet for Vec<u8> {
    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Packet for str {
    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Packet for String {
    fn encode(&self) -> Result<Bytes> {
        self.as_str().encode()
    }
}

impl<P: Packet + ?Sized> Packet for &P {
    fn encode(&self) -> Result<Bytes> {
        (**self).encode()
    }
}

/// 把任意编码闭包的失败统一包装为发送错误。
pub fn encode_failure(reason: impl std::fmt::Display) -> TetherError {
    TetherError::send_failed(format_args!("packet encoding failed: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Packet for Broken {
        fn encode(&self) -> Result<Bytes> {
            Err(encode_failure("field `len` overflows u16"))
        }
    }

    #[test]
    fn raw_and_text_packets_encode_verbatim() {
        assert_eq!(RawPacket::new(&b"PING"[..]).encode().unwrap(), &b"PING"[..]);
        assert_eq!("PING".encode().unwrap(), &b"PING"[..]);
        assert_eq!(vec![1u8, 2, 3].encode().unwrap(), &[1u8, 2, 3][..]);
    }

    #[test]
    fn encode_failure_is_send_failed() {
        let err = Broken.encode().unwrap_err();
        assert!(matches!(err, TetherError::SendFailed { .. }));
        assert!(err.to_string().contains("overflows"));
    }
}
