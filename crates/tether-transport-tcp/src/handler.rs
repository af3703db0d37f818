//! 应用层回调能力集。
//!
//! 引擎在构造时注入一个实现了 [`ServerHandler`] 或 [`ClientHandler`] 的对象，
//! 所有连接事件都通过它送达；回调可以借助传入的引擎句柄发送、拒绝或广播。
//!
//! # 接收回调的错误语义
//! `on_received` 返回错误或发生 panic 时，引擎会清空该连接的接收缓冲并继续读取，
//! 不会关闭连接。若分帧逻辑在上一次回调中留下了尚不完整的帧（见
//! [`ConnectionState::unread`]），这部分字节也会一并丢弃，分帧实现需要能从下一块
//! 数据重新同步。
//!
//! # 在回调中关闭引擎
//! 回调运行在连接自己的接收任务（或服务端的 accept 任务）上，可以直接 `await` 引擎的
//! `close`：关闭不会等待调用方所在的任务，当前连接在回调返回后读到零字节并照常收尾，
//! 断开通知因此晚于 `close` 的返回。

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{ConnectionId, Packet, Result};

use crate::client::ClientEngine;
use crate::server::ServerEngine;
use crate::state::ConnectionState;

/// 服务端连接事件。
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// 新连接完成保活配置与登记后、首次读取之前调用一次。
    ///
    /// 返回错误等同于调用 [`ServerEngine::reject`]：连接经由断开路径关闭，
    /// `on_disconnected` 随后照常触发。
    async fn on_accepted(&self, _server: &ServerEngine, _state: &Arc<ConnectionState>) -> Result<()> {
        Ok(())
    }

    /// 每收到一块数据调用一次，新数据已追加到 `state` 的接收缓冲末尾。
    async fn on_received(&self, server: &ServerEngine, state: &Arc<ConnectionState>) -> Result<()>;

    /// 连接关闭时对每个连接 ID 恰好调用一次。此时上下文已经归还。
    async fn on_disconnected(&self, _server: &ServerEngine, _id: ConnectionId) {}

    /// 广播扩展点，默认不做任何事。
    ///
    /// 需要扇出的实现可以遍历 [`ServerEngine::connections`] 的快照并逐个调用
    /// [`ServerEngine::send`]，或直接使用 [`ServerEngine::send_to_all`]。
    async fn broadcast(
        &self,
        _server: &ServerEngine,
        _packet: &dyn Packet,
        _origin: &Arc<ConnectionState>,
    ) {
    }
}

/// 客户端连接事件。
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// 建连成功且保活配置完成后、首次读取之前调用一次。
    async fn on_connected(&self, _client: &ClientEngine, _state: &Arc<ConnectionState>) {}

    /// 语义同 [`ServerHandler::on_received`]。
    async fn on_received(&self, client: &ClientEngine, state: &Arc<ConnectionState>) -> Result<()>;

    /// 每条已建立的连接关闭时恰好调用一次。
    async fn on_disconnected(&self, _client: &ClientEngine) {}
}
