use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tether_core::{ConnectionId, ConnectionIdGenerator, Packet, Result, ServerConfig, TetherError};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ACCEPT, BIND, LISTEN, map_setup_error};
use crate::handler::ServerHandler;
use crate::keepalive::apply_keepalive;
use crate::pool::{IoContext, IoContextPool, PoolStats};
use crate::pump::{self, PumpEvents, PumpTracker, panic_message};
use crate::state::{ConnectionState, Link};
use crate::table::ConnectionTable;

/// 瞬时性 accept 失败（如文件描述符耗尽）后的退避时间。
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 服务端引擎生命周期。`Stopped` 为终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerPhase {
    NotStarted,
    Listening,
    Stopped,
}

#[derive(Debug)]
enum Lifecycle {
    NotStarted,
    Listening {
        local_addr: SocketAddr,
        accept_loop: JoinHandle<()>,
    },
    Stopped,
}

struct ServerShared {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    pool: IoContextPool,
    table: ConnectionTable,
    ids: ConnectionIdGenerator,
    lifecycle: Mutex<Lifecycle>,
    stop: watch::Sender<bool>,
    pumps: Arc<PumpTracker>,
}

/// 多客户端 TCP 服务端引擎。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 独立的 accept 任务逐个接受连接，为每条连接从 [`IoContextPool`] 借出上下文、
///   分配连接 ID、登记到 [`ConnectionTable`]，再交给独立的接收泵任务；
/// - 应用逻辑通过注入的 [`ServerHandler`] 接入，不需要继承或包装引擎。
///
/// ## 逻辑 (How)
/// - accept 循环一次只有一个未完成的 `accept`，并在完成该连接的全部建立步骤后才发起下一次：
///   连接建立是串行的，以吞吐换取简单可推理的顺序；
/// - 每条连接的收尾（移出连接表、归还上下文、断开通知）由持有该上下文的一方恰好执行一次，
///   其它线程的关闭请求只负责 `shutdown` 套接字。
///
/// ## 契约 (What)
/// - `start` 重复调用为空操作，返回首次绑定的地址；`close` 之后再 `start` 返回
///   [`TetherError::EngineStopped`]；
/// - `send` 失败不向调用方传播，而是关闭该连接；
/// - `close` 等待 accept 循环退出、关闭所有活跃连接并等待其收尾完成，最后释放上下文池。
///
/// ## 注意事项 (Trade-offs)
/// - accept 任务持有引擎的一个克隆，引擎不会因句柄全部被丢弃而自动停止，必须显式 `close`；
/// - `Fail` 策略下池耗尽时新连接被直接丢弃（对端观察到连接被关闭），`Wait` 策略下
///   accept 循环挂起直到有连接断开。
#[derive(Clone)]
pub struct ServerEngine {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEngine")
            .field("phase", &self.phase())
            .field("connections", &self.shared.table.len())
            .field("pool", &self.shared.pool.stats())
            .finish()
    }
}

impl ServerEngine {
    /// 以给定配置与回调构造引擎，立即预分配全部 I/O 上下文。
    pub fn new<H>(config: ServerConfig, handler: H) -> Result<Self>
    where
        H: ServerHandler,
    {
        config.validate()?;
        let pool = IoContextPool::new(
            config.pool_capacity,
            config.receive_buffer_size,
            config.exhaustion,
        )?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                handler: Arc::new(handler),
                pool,
                table: ConnectionTable::new(),
                ids: ConnectionIdGenerator::new(),
                lifecycle: Mutex::new(Lifecycle::NotStarted),
                stop,
                pumps: Arc::new(PumpTracker::default()),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> ServerPhase {
        match &*self.shared.lifecycle.lock() {
            Lifecycle::NotStarted => ServerPhase::NotStarted,
            Lifecycle::Listening { .. } => ServerPhase::Listening,
            Lifecycle::Stopped => ServerPhase::Stopped,
        }
    }

    /// 监听中时返回实际绑定的地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.shared.lifecycle.lock() {
            Lifecycle::Listening { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.shared.table
    }

    pub fn pool(&self) -> &IoContextPool {
        &self.shared.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// 在所有地址上监听 `port`。
    pub async fn start_any(&self, port: u16) -> Result<SocketAddr> {
        self.start("", port).await
    }

    /// 绑定 `address:port` 并启动 accept 循环，返回实际绑定的地址。
    ///
    /// `address` 为空表示 `0.0.0.0`；非 IP 字面量按主机名解析并取第一个结果。
    pub async fn start(&self, address: &str, port: u16) -> Result<SocketAddr> {
        {
            let lifecycle = self.shared.lifecycle.lock();
            match &*lifecycle {
                Lifecycle::NotStarted => {}
                Lifecycle::Listening { local_addr, .. } => return Ok(*local_addr),
                Lifecycle::Stopped => return Err(TetherError::EngineStopped),
            }
        }

        let addr = resolve(address, port).await?;
        let listener = listen(addr, self.shared.config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_setup_error(BIND, err))?;

        let mut lifecycle = self.shared.lifecycle.lock();
        match &*lifecycle {
            // 并发的另一次 start 先完成了绑定，本次监听器直接丢弃。
            Lifecycle::Listening { local_addr, .. } => return Ok(*local_addr),
            Lifecycle::Stopped => return Err(TetherError::EngineStopped),
            Lifecycle::NotStarted => {}
        }
        let accept_loop = tokio::spawn(self.clone().accept_loop(listener));
        *lifecycle = Lifecycle::Listening {
            local_addr,
            accept_loop,
        };
        info!(
            %local_addr,
            backlog = self.shared.config.backlog,
            pool_capacity = self.shared.pool.capacity(),
            "server listening"
        );
        Ok(local_addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut stop = self.shared.stop.subscribe();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.setup_connection(stream, peer, &mut stop).await,
                Err(err) => {
                    let err = map_setup_error(ACCEPT, err);
                    error!(error = %err, code = err.code(), "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        info!("accept loop stopped");
    }

    /// 完成一条已接受连接的全部建立步骤，期间不会发起下一次 accept。
    async fn setup_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        stop: &mut watch::Receiver<bool>,
    ) {
        let leased = tokio::select! {
            biased;
            _ = stopped(stop) => Err(TetherError::EngineStopped),
            leased = self.shared.pool.pop() => leased,
        };
        let ctx = match leased {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(%peer, error = %err, "dropping accepted connection");
                return;
            }
        };

        let id = self.shared.ids.next_id();
        let state = Arc::clone(ctx.state());
        let link = Arc::new(Link::new(stream, peer));
        state.bind(id, Arc::clone(&link));

        if let Err(err) = apply_keepalive(link.stream(), &self.shared.config.keepalive) {
            warn!(connection_id = %id, %peer, error = %err, "keepalive setup failed");
            state.close(id);
            self.finish(ctx, id).await;
            return;
        }

        if let Some(previous) = self.shared.table.insert(id, Arc::clone(&state))
            && !Arc::ptr_eq(&previous, &state)
        {
            warn!(connection_id = %id, "replacing stale connection table entry");
            self.close_connection(id, &previous);
        }
        info!(connection_id = %id, %peer, slot = ctx.slot(), "connection accepted");

        let accepted = AssertUnwindSafe(self.shared.handler.on_accepted(self, &state))
            .catch_unwind()
            .await;
        match accepted {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(connection_id = %id, error = %err, "accept handler failed, closing connection");
                self.close_connection(id, &state);
            }
            Err(panic) => {
                let err = accept_panic(panic.as_ref());
                error!(connection_id = %id, error = %err, code = err.code(), "accept handler panicked");
                self.close_connection(id, &state);
            }
        }
        if !state.is_current(id) {
            self.finish(ctx, id).await;
            return;
        }

        let events = ServerPump {
            server: self.clone(),
        };
        self.shared.pumps.spawn(pump::run(events, ctx, id, link));
    }

    /// 关闭连接并立即移出连接表，表内条目因此始终处于 `Connected`。
    ///
    /// 返回值同 [`ConnectionState::close`]；收尾仍由持有上下文的一方完成。
    fn close_connection(&self, id: ConnectionId, state: &Arc<ConnectionState>) -> bool {
        let closed = state.close(id);
        self.shared.table.remove_if_current(id, state);
        closed
    }

    /// 连接收尾：移出连接表、归还上下文、触发一次断开通知。
    ///
    /// 只有持有 `ctx` 的一方能调用，因此对同一次租约天然只执行一次。
    async fn finish(&self, ctx: IoContext, id: ConnectionId) {
        let state = Arc::clone(ctx.state());
        state.close(id);
        self.shared.table.remove_if_current(id, &state);
        if !self.shared.pool.push(ctx) {
            debug!(connection_id = %id, "io context not returned to a live pool");
        }
        info!(connection_id = %id, "connection closed");

        let notified = AssertUnwindSafe(self.shared.handler.on_disconnected(self, id))
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

    /// 供 `on_accepted` 使用的提前关闭入口；连接随后经由断开路径收尾。
    pub fn reject(&self, state: &Arc<ConnectionState>) {
        if let Some(id) = state.id()
            && self.close_connection(id, state)
        {
            info!(connection_id = %id, "connection rejected");
        }
    }

    /// 按 ID 关闭一条活跃连接；连接不存在或已在关闭中时返回 `false`。
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.shared
            .table
            .get(id)
            .is_some_and(|state| self.close_connection(id, &state))
    }

    /// 发送报文；编码或写入失败时关闭该连接，返回是否写入成功。
    ///
    /// 编码结果为空时不写入也不关闭连接。
    pub async fn send<P>(&self, state: &Arc<ConnectionState>, packet: &P) -> bool
    where
        P: Packet + ?Sized,
    {
        let Some(id) = state.id() else {
            debug!(slot = state.slot(), "send on idle connection state ignored");
            return false;
        };
        let sent = match packet.encode() {
            Ok(bytes) if bytes.is_empty() => return false,
            Ok(bytes) => state.send_bytes(id, &bytes).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => true,
            Err(err) => {
                warn!(connection_id = %id, error = %err, code = err.code(), "send failed, closing connection");
                self.close_connection(id, state);
                false
            }
        }
    }

    /// 交给 [`ServerHandler::broadcast`] 处理。
    pub async fn broadcast(&self, packet: &dyn Packet, origin: &Arc<ConnectionState>) {
        self.shared.handler.broadcast(self, packet, origin).await;
    }

    /// 向连接表快照中的每条连接发送同一报文，返回成功写入的连接数。
    pub async fn send_to_all<P>(&self, packet: &P) -> usize
    where
        P: Packet + ?Sized,
    {
        let mut delivered = 0;
        for (_, state) in self.shared.table.snapshot() {
            if self.send(&state, packet).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// 停止 accept 循环，关闭全部连接并等待其收尾，最后释放上下文池。可重复调用。
    ///
    /// 可以在任意回调中调用：调用方所在的 accept 任务或接收泵不会被等待，
    /// 对应连接在回调返回后照常收尾，上下文归还到已释放的池时只做重置。
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.shared.lifecycle.lock(), Lifecycle::Stopped);
        let accept_loop = match previous {
            Lifecycle::Stopped => return,
            Lifecycle::NotStarted => None,
            Lifecycle::Listening { accept_loop, .. } => Some(accept_loop),
        };

        self.shared.stop.send_replace(true);
        // 从 `on_accepted` 发起的关闭运行在 accept 任务自身上，不能等待它。
        if let Some(accept_loop) = accept_loop
            && tokio::task::try_id() != Some(accept_loop.id())
            && let Err(err) = accept_loop.await
        {
            error!(error = %err, "accept loop terminated abnormally");
        }

        for (id, state) in self.shared.table.snapshot() {
            self.close_connection(id, &state);
        }
        self.shared.pumps.wait_idle().await;
        self.shared.pool.dispose();
        info!("server closed");
    }
}

struct ServerPump {
    server: ServerEngine,
}

#[async_trait]
impl PumpEvents for ServerPump {
    async fn received(&self, state: &Arc<ConnectionState>) -> Result<()> {
        self.server
            .shared
            .handler
            .on_received(&self.server, state)
            .await
    }

    async fn finished(&self, ctx: IoContext, id: ConnectionId) {
        self.server.finish(ctx, id).await;
    }
}

fn accept_panic(payload: &(dyn std::any::Any + Send)) -> TetherError {
    TetherError::Setup {
        code: ACCEPT.code,
        operation: ACCEPT.message,
        message: panic_message(payload),
    }
}

/// 收到停止信号后返回；发送端随引擎存活，不会提前关闭。
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    if address.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut candidates = tokio::net::lookup_host((address, port))
        .await
        .map_err(|err| map_setup_error(BIND, err))?;
    candidates.next().ok_or_else(|| TetherError::Setup {
        code: BIND.code,
        operation: BIND.message,
        message: format!("`{address}` did not resolve to any address"),
    })
}

fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| map_setup_error(BIND, err))?;
    #[cfg(not(windows))]
    socket
        .set_reuseaddr(true)
        .map_err(|err| map_setup_error(BIND, err))?;
    socket.bind(addr).map_err(|err| map_setup_error(BIND, err))?;
    socket
        .listen(backlog)
        .map_err(|err| map_setup_error(LISTEN, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl ServerHandler for Silent {
        async fn on_received(&self, _server: &ServerEngine, state: &Arc<ConnectionState>) -> Result<()> {
            state.clear_received();
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_address_binds_unspecified() {
        let addr = resolve("", 4000).await.expect("解析空地址");
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4000));
        let addr = resolve("127.0.0.1", 9).await.expect("解析 IP 字面量");
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_is_start_once_then_terminal() {
        let server = ServerEngine::new(ServerConfig::default().with_pool_capacity(2), Silent)
            .expect("构造服务端");
        assert_eq!(server.phase(), ServerPhase::NotStarted);

        let first = server.start("127.0.0.1", 0).await.expect("启动监听");
        let second = server.start("127.0.0.1", 0).await.expect("重复启动为空操作");
        assert_eq!(first, second);
        assert_eq!(server.phase(), ServerPhase::Listening);

        server.close().await;
        server.close().await;
        assert_eq!(server.phase(), ServerPhase::Stopped);
        assert!(server.local_addr().is_none());
        assert_eq!(
            server.start("127.0.0.1", 0).await.unwrap_err(),
            TetherError::EngineStopped
        );
        assert!(server.pool().is_disposed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_config_is_rejected_at_construction() {
        let err = ServerEngine::new(ServerConfig::default().with_pool_capacity(0), Silent)
            .unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[test]
    fn accept_panic_is_a_setup_failure() {
        let err = accept_panic(&"no room");
        assert!(matches!(err, TetherError::Setup { .. }), "{err:?}");
        assert_eq!(err.code(), ACCEPT.code);
        assert!(err.to_string().contains("handler panicked: no room"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_before_start_disposes_pool() {
        let server = ServerEngine::new(ServerConfig::default().with_pool_capacity(1), Silent)
            .expect("构造服务端");
        server.close().await;
        assert_eq!(server.phase(), ServerPhase::Stopped);
        assert!(server.pool().is_disposed());
    }
}
