#![doc = r#"
# tether-transport-tcp

## 设计动机（Why）
- **定位**：在 Tokio 之上实现 TCP 连接生命周期引擎：服务端 accept 循环、客户端建连、
  每连接一个接收任务、I/O 上下文池化复用以及恰好一次的关闭路径。
- **架构角色**：只搬运原始字节。分帧、加密与消息语义由注入的
  [`ServerHandler`]/[`ClientHandler`] 负责。

## 核心契约（What）
- [`ServerEngine`]：`start` → 串行 accept → 借出上下文、分配 ID、配置保活、登记连接表、
  `on_accepted` → 接收泵；`close` 停止监听并等待所有连接收尾；
- [`ClientEngine`]：`connect` 带超时，成功后与服务端共用同一接收泵；
- [`ConnectionState`]：连接 ID、套接字、接收缓冲与阶段，`socket 存在 ⇔ Connected`；
- [`IoContextPool`] / [`ConnectionTable`]：固定容量的上下文竞技场与按 ID 索引的活跃连接表。

## 风险与考量（Trade-offs）
- 没有显式取消令牌：关闭一条连接即 `shutdown` 其套接字，挂起的读取以零字节完成，
  接收泵据此退出并完成收尾；
- 保活参数在 Windows 上通过 12 字节控制块下发，其他平台映射为等价的可移植套接字选项。
"#]

mod client;
mod error;
mod handler;
mod keepalive;
mod pool;
mod pump;
mod server;
mod state;
mod table;

pub use client::ClientEngine;
pub use handler::{ClientHandler, ServerHandler};
pub use pool::{IoContext, IoContextPool, PoolStats};
pub use server::{ServerEngine, ServerPhase};
pub use state::{ConnectionPhase, ConnectionState};
pub use table::ConnectionTable;

pub use tether_core::{
    ClientConfig, ConnectionId, ExhaustionPolicy, KeepAliveConfig, Packet, RawPacket, Result,
    ServerConfig, TetherError, encode_failure,
};
