use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use tether_core::{ConnectionId, Packet, Result, TetherError};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::map_write_error;

/// 连接所处的生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// 上下文在池中待命，尚未绑定任何连接。
    Uninitialized,
    /// 持有活跃套接字。
    Connected,
    /// 连接已经走完关闭路径，等待上下文归还。
    Closed,
}

/// 一条已建立连接的套接字及其写入闸门。
///
/// 读路径只由接收泵使用，写路径由 `write_gate` 串行化，二者都只需要
/// `&TcpStream`，因此关闭时可以在任意线程直接对套接字执行 `shutdown`。
#[derive(Debug)]
pub(crate) struct Link {
    stream: TcpStream,
    write_gate: AsyncMutex<()>,
    peer_addr: SocketAddr,
}

impl Link {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            write_gate: AsyncMutex::new(()),
            peer_addr,
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 等待可读并读取一次；返回 `Ok(0)` 表示对端关闭或本端已 `shutdown`。
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// 写完整个缓冲；并发写入按到达闸门的顺序依次完成，不会交错。
    pub(crate) async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        let _gate = self.write_gate.lock().await;
        while !data.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// 双向关闭套接字，挂起的读取随之以零字节完成。
    pub(crate) fn shutdown(&self) {
        // 对端先行关闭时这里会得到 `NotConnected`，属于预期情况。
        let _ = SockRef::from(&self.stream).shutdown(Shutdown::Both);
    }

    /// 非阻塞窥探：对端已半关闭或套接字出错时返回 `true`。
    pub(crate) fn is_peer_closed(&self) -> bool {
        let mut probe = [std::mem::MaybeUninit::<u8>::uninit(); 1];
        match SockRef::from(&self.stream).peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

#[derive(Debug)]
struct StateInner {
    id: Option<ConnectionId>,
    phase: ConnectionPhase,
    link: Option<Arc<Link>>,
}

/// 单条连接的状态：唯一 ID、套接字、接收缓冲与生命周期阶段。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每个 I/O 上下文在池初始化时创建一份 `ConnectionState`，之后只做重置不做重新分配，
///   高频建连/断连时不会产生分配抖动。
///
/// ## 契约 (What)
/// - 不变量：`socket 存在 ⇔ phase == Connected`；
/// - [`init`](Self::init) 无论当前阶段如何都把状态重置为 `Uninitialized`，可重复调用；
/// - [`send`](Self::send) 在没有套接字时返回 [`TetherError::Disconnected`]；
/// - 接收缓冲按到达顺序保存原始字节块，由外部分帧逻辑消费。
///
/// ## 注意事项 (Trade-offs)
/// - 上下文被复用后，应用层仍持有的旧 `Arc<ConnectionState>` 会观察到新连接；
///   需要跨越连接生命周期引用某条连接时，请同时记录 [`id`](Self::id) 并在使用前比对。
#[derive(Debug)]
pub struct ConnectionState {
    slot: usize,
    inner: Mutex<StateInner>,
    received: Mutex<VecDeque<Bytes>>,
}

impl ConnectionState {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            inner: Mutex::new(StateInner {
                id: None,
                phase: ConnectionPhase::Uninitialized,
                link: None,
            }),
            received: Mutex::new(VecDeque::new()),
        }
    }

    /// 所属 I/O 上下文在池中的槽位。
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// 当前绑定的连接 ID；未绑定时为 `None`。
    pub fn id(&self) -> Option<ConnectionId> {
        self.inner.lock().id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase == ConnectionPhase::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().link.as_ref().map(|link| link.peer_addr())
    }

    /// 重置为 `Uninitialized`：清空接收缓冲并放弃套接字。
    pub fn init(&self) {
        let link = {
            let mut inner = self.inner.lock();
            inner.id = None;
            inner.phase = ConnectionPhase::Uninitialized;
            inner.link.take()
        };
        if let Some(link) = link {
            link.shutdown();
        }
        self.received.lock().clear();
    }

    /// 序列化报文并写入套接字。
    pub async fn send<P>(&self, packet: &P) -> Result<()>
    where
        P: Packet + ?Sized,
    {
        let link = self.link().ok_or(TetherError::Disconnected)?;
        let bytes = packet.encode()?;
        link.write_all(&bytes).await.map_err(map_write_error)
    }

    /// 向 `id` 对应的连接写入已编码字节；连接已关闭或上下文已复用时返回 `Disconnected`。
    pub(crate) async fn send_bytes(&self, id: ConnectionId, bytes: &[u8]) -> Result<()> {
        let link = self.link_for(id).ok_or(TetherError::Disconnected)?;
        link.write_all(bytes).await.map_err(map_write_error)
    }

    /// 接收缓冲中尚未消费的字节块数量。
    pub fn received_len(&self) -> usize {
        self.received.lock().len()
    }

    /// 接收缓冲中尚未消费的总字节数。
    pub fn received_bytes(&self) -> usize {
        self.received.lock().iter().map(Bytes::len).sum()
    }

    /// 取出最早到达的字节块。
    pub fn pop_received(&self) -> Option<Bytes> {
        self.received.lock().pop_front()
    }

    /// 按到达顺序取出全部字节块。
    pub fn drain_received(&self) -> Vec<Bytes> {
        self.received.lock().drain(..).collect()
    }

    /// 将尚不足一帧的剩余字节放回缓冲头部，等待下一块数据到达后再分帧。
    pub fn unread(&self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.received.lock().push_front(chunk);
        }
    }

    pub fn clear_received(&self) {
        self.received.lock().clear();
    }

    pub(crate) fn push_received(&self, chunk: Bytes) {
        self.received.lock().push_back(chunk);
    }

    /// 绑定新连接并进入 `Connected`。
    pub(crate) fn bind(&self, id: ConnectionId, link: Arc<Link>) {
        self.received.lock().clear();
        let mut inner = self.inner.lock();
        inner.id = Some(id);
        inner.phase = ConnectionPhase::Connected;
        inner.link = Some(link);
    }

    pub(crate) fn link(&self) -> Option<Arc<Link>> {
        self.inner.lock().link.clone()
    }

    /// 仅当状态仍代表 `id` 时返回其套接字，防止写入已被复用的上下文。
    pub(crate) fn link_for(&self, id: ConnectionId) -> Option<Arc<Link>> {
        let inner = self.inner.lock();
        if inner.id == Some(id) && inner.phase == ConnectionPhase::Connected {
            inner.link.clone()
        } else {
            None
        }
    }

    /// 状态是否仍然代表 `id` 对应的活跃连接。
    pub(crate) fn is_current(&self, id: ConnectionId) -> bool {
        self.link_for(id).is_some()
    }

    /// 关闭路径的独占入口：只有把 `id` 从 `Connected` 迁移到 `Closed` 的那一次调用返回 `true`。
    ///
    /// 迁移与套接字 `shutdown` 在同一临界区内完成，并发或重复调用直接返回 `false`。
    pub(crate) fn close(&self, id: ConnectionId) -> bool {
        let link = {
            let mut inner = self.inner.lock();
            if inner.id != Some(id) || inner.phase != ConnectionPhase::Connected {
                return false;
            }
            inner.phase = ConnectionPhase::Closed;
            inner.link.take()
        };
        if let Some(link) = link {
            link.shutdown();
        }
        self.received.lock().clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::RawPacket;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_state(id: u64) -> (ConnectionState, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定回环地址");
        let addr = listener.local_addr().expect("读取监听地址");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_side, peer) = accepted.expect("接受回环连接");
        let state = ConnectionState::new(0);
        state.bind(ConnectionId::new(id), Arc::new(Link::new(server_side, peer)));
        (state, client.expect("建立回环连接"))
    }

    #[test]
    fn fresh_state_is_uninitialized() {
        let state = ConnectionState::new(3);
        assert_eq!(state.slot(), 3);
        assert_eq!(state.id(), None);
        assert_eq!(state.phase(), ConnectionPhase::Uninitialized);
        assert!(state.peer_addr().is_none());
        state.init();
        state.init();
        assert_eq!(state.phase(), ConnectionPhase::Uninitialized);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_without_socket_is_disconnected() {
        let state = ConnectionState::new(0);
        let err = state.send(&RawPacket::new(&b"PING"[..])).await.unwrap_err();
        assert_eq!(err, TetherError::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_writes_encoded_bytes() {
        let (state, mut peer) = connected_state(1).await;
        state.send("PING").await.expect("发送报文");

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.expect("对端读取");
        assert_eq!(&buf, b"PING");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_effective_once_per_id() {
        let (state, mut peer) = connected_state(7).await;
        state.push_received(Bytes::from_static(b"partial"));

        assert!(!state.close(ConnectionId::new(8)), "ID 不匹配时不得关闭");
        assert!(state.close(ConnectionId::new(7)));
        assert!(!state.close(ConnectionId::new(7)), "第二次关闭必须是空操作");
        assert_eq!(state.phase(), ConnectionPhase::Closed);
        assert_eq!(state.received_len(), 0);
        assert!(state.link().is_none());

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.expect("对端读取 EOF"), 0);

        state.init();
        assert_eq!(state.phase(), ConnectionPhase::Uninitialized);
        assert_eq!(state.id(), None);
    }

    #[test]
    fn receive_buffer_keeps_arrival_order() {
        let state = ConnectionState::new(0);
        state.push_received(Bytes::from_static(b"ab"));
        state.push_received(Bytes::from_static(b"cde"));
        assert_eq!(state.received_len(), 2);
        assert_eq!(state.received_bytes(), 5);

        let first = state.pop_received().expect("首块");
        assert_eq!(&first[..], b"ab");
        state.unread(first.slice(1..));
        let rest = state.drain_received();
        assert_eq!(rest, vec![Bytes::from_static(b"b"), Bytes::from_static(b"cde")]);
        assert_eq!(state.received_len(), 0);
    }
}
