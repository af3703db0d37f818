use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tether_core::{
    ClientConfig, ConnectionId, ConnectionIdGenerator, ExhaustionPolicy, Packet, Result,
    TetherError,
};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::handler::ClientHandler;
use crate::keepalive::apply_keepalive;
use crate::pool::{IoContext, IoContextPool};
use crate::pump::{self, PumpEvents, PumpTracker, panic_message};
use crate::state::{ConnectionState, Link};

struct ClientShared {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    // 单槽位、`Wait` 策略：重连会等待上一条连接的接收泵归还上下文。
    pool: IoContextPool,
    state: Arc<ConnectionState>,
    ids: ConnectionIdGenerator,
    remote: Mutex<Option<SocketAddr>>,
    connect_gate: tokio::sync::Mutex<()>,
    pumps: Arc<PumpTracker>,
}

/// 单连接 TCP 客户端引擎。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 与 [`ServerEngine`](crate::ServerEngine) 共用连接状态、上下文池与接收泵，
///   只管理一条连接；应用逻辑通过注入的 [`ClientHandler`] 接入。
///
/// ## 契约 (What)
/// - `connect` 在已连接时为空操作；超时或底层失败均返回 [`TetherError::ConnectFailed`]，
///   失败后状态被重置，可以再次尝试；
/// - `is_connected` 在没有套接字时返回 `false`，否则做一次有界的非阻塞探测以发现对端半关闭；
/// - `send` 在没有套接字时返回 [`TetherError::Disconnected`]，其余失败只记录日志并关闭连接；
/// - `close` 关闭当前连接并等待接收泵收尾，引擎可以继续用于下一次 `connect`。
#[derive(Clone)]
pub struct ClientEngine {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEngine")
            .field("id", &self.shared.state.id())
            .field("phase", &self.shared.state.phase())
            .field("remote", &self.remote())
            .finish()
    }
}

impl ClientEngine {
    pub fn new<H>(config: ClientConfig, handler: H) -> Result<Self>
    where
        H: ClientHandler,
    {
        config.validate()?;
        let pool = IoContextPool::new(1, config.receive_buffer_size, ExhaustionPolicy::Wait)?;
        let state = pool.state(0).cloned().ok_or_else(|| TetherError::Config {
            reason: "client io context pool has no slot".to_owned(),
        })?;
        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                handler: Arc::new(handler),
                pool,
                state,
                ids: ConnectionIdGenerator::new(),
                remote: Mutex::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
                pumps: Arc::new(PumpTracker::default()),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// 唯一的连接状态；跨重连保持同一个实例。
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.shared.state
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.shared.state.id()
    }

    /// 最近一次成功连接的对端地址。
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.shared.remote.lock()
    }

    /// 以配置中的超时连接 `host:port`。
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_with_timeout(host, port, self.shared.config.connect_timeout)
            .await
    }

    /// 在 `limit` 内完成连接；已连接时直接返回。
    ///
    /// 等待上一条连接归还上下文与建立 TCP 连接共享同一个截止时间。
    pub async fn connect_with_timeout(&self, host: &str, port: u16, limit: Duration) -> Result<()> {
        let _gate = self.shared.connect_gate.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        let deadline = Instant::now() + limit;
        let ctx = match timeout_at(deadline, self.shared.pool.pop()).await {
            Ok(leased) => leased.map_err(TetherError::connect_failed)?,
            Err(_) => {
                return Err(TetherError::connect_failed(format!(
                    "previous connection still closing after {} ms",
                    limit.as_millis()
                )));
            }
        };

        let stream = match timeout_at(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.shared.pool.push(ctx);
                warn!(%host, port, error = %err, "connect failed");
                return Err(TetherError::connect_failed(err));
            }
            Err(_) => {
                self.shared.pool.push(ctx);
                warn!(%host, port, timeout_ms = limit.as_millis() as u64, "connect timed out");
                return Err(TetherError::connect_failed(format!(
                    "connect to {host}:{port} timed out after {} ms",
                    limit.as_millis()
                )));
            }
        };

        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                self.shared.pool.push(ctx);
                return Err(TetherError::connect_failed(err));
            }
        };
        if let Err(err) = apply_keepalive(&stream, &self.shared.config.keepalive) {
            self.shared.pool.push(ctx);
            return Err(TetherError::connect_failed(err));
        }

        let id = self.shared.ids.next_id();
        let state = Arc::clone(ctx.state());
        let link = Arc::new(Link::new(stream, peer));
        state.bind(id, Arc::clone(&link));
        *self.shared.remote.lock() = Some(peer);
        info!(connection_id = %id, %peer, "connected");

        let connected = AssertUnwindSafe(self.shared.handler.on_connected(self, &state))
            .catch_unwind()
            .await;
        if let Err(panic) = connected {
            warn!(
                connection_id = %id,
                reason = %panic_message(panic.as_ref()),
                "connect handler panicked"
            );
        }

        let events = ClientPump {
            client: self.clone(),
        };
        self.shared.pumps.spawn(pump::run(events, ctx, id, link));
        Ok(())
    }

    /// 连接是否仍然可用。
    ///
    /// 没有套接字时立即返回 `false`；否则最多等待 `probe_timeout` 观察可读性，
    /// 可读且窥探到零字节或错误即视为对端已关闭。
    pub async fn is_connected(&self) -> bool {
        let Some(link) = self.shared.state.link() else {
            return false;
        };
        match timeout(self.shared.config.probe_timeout, link.stream().readable()).await {
            Err(_) => true,
            Ok(Err(_)) => false,
            Ok(Ok(())) => !link.is_peer_closed(),
        }
    }

    /// 发送报文。没有套接字时返回 `Disconnected`；编码或写入失败时关闭连接并返回 `Ok`。
    pub async fn send<P>(&self, packet: &P) -> Result<()>
    where
        P: Packet + ?Sized,
    {
        let state = &self.shared.state;
        let Some(id) = state.id().filter(|id| state.is_current(*id)) else {
            return Err(TetherError::Disconnected);
        };
        let sent = match packet.encode() {
            Ok(bytes) => state.send_bytes(id, &bytes).await,
            Err(err) => Err(err),
        };
        match sent {
            Err(TetherError::Disconnected) => Err(TetherError::Disconnected),
            Err(err) => {
                warn!(connection_id = %id, error = %err, code = err.code(), "send failed, closing connection");
                state.close(id);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// 关闭当前连接并等待收尾完成；没有连接时为空操作。
    ///
    /// 在回调中调用时只关闭套接字并立即返回，断开通知在回调返回后由接收泵发出。
    pub async fn close(&self) {
        let state = &self.shared.state;
        if let Some(id) = state.id()
            && state.close(id)
        {
            debug!(connection_id = %id, "closing connection");
        }
        self.shared.pumps.wait_idle().await;
    }

    async fn finish(&self, ctx: IoContext, id: ConnectionId) {
        let state = Arc::clone(ctx.state());
        state.close(id);
        self.shared.pool.push(ctx);
        info!(connection_id = %id, "disconnected");

        let notified = AssertUnwindSafe(self.shared.handler.on_disconnected(self))
            .catch_unwind()
            .await;
        if let Err(panic) = notified {
            error!(
                connection_id = %id,
                reason = %panic_message(panic.as_ref()),
                "disconnect handler panicked"
            );
        }
    }
}

struct ClientPump {
    client: ClientEngine,
}

#[async_trait]
impl PumpEvents for ClientPump {
    async fn received(&self, state: &Arc<ConnectionState>) -> Result<()> {
        self.client
            .shared
            .handler
            .on_received(&self.client, state)
            .await
    }

    async fn finished(&self, ctx: IoContext, id: ConnectionId) {
        self.client.finish(ctx, id).await;
    }
}
