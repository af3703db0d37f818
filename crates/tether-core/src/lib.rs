#![doc = r#"
# tether-core

## 设计动机（Why）
- **定位**：承载 TCP 连接生命周期引擎中与运行时无关的契约：统一错误域、
  套接字/引擎配置、出站报文抽象、连接 ID 发号器以及双缓冲优先队列。
- **架构角色**：`tether-transport-tcp` 在 Tokio 之上实现服务端/客户端引擎，
  本 crate 只提供它们共享的类型，不依赖任何异步运行时。

## 核心契约（What）
- [`TetherError`]：连接期、发送期、接收期与关闭期的全部失败语义，附带稳定错误码；
- [`config`]：`KeepAliveConfig`、`ServerConfig`、`ClientConfig`，支持 Builder 与 TOML 加载；
- [`Packet`]：任何可序列化为字节序列的出站单元；
- [`ConnectionIdGenerator`]：单调递增、从 1 开始的连接 ID；
- [`collections::DoubleBufferedQueue`]：读/写角色可交换的双优先队列。

## 风险与考量（Trade-offs）
- 双缓冲队列本身不做同步，跨线程共享请使用
  [`collections::SharedDoubleBufferedQueue`]。
"#]

pub mod collections;
pub mod config;
pub mod error;
pub mod id;
pub mod packet;

pub use collections::{DoubleBufferedQueue, Order, SharedDoubleBufferedQueue};
pub use config::{ClientConfig, ExhaustionPolicy, KeepAliveConfig, ServerConfig};
pub use error::{Result, TetherError};
pub use id::{ConnectionId, ConnectionIdGenerator};
pub use packet::{Packet, RawPacket, encode_failure};
