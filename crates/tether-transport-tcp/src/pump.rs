//! 服务端与客户端共用的接收泵。
//!
//! 每条连接一个任务，顺序执行“读取 → 追加到接收缓冲 → 回调 → 再次读取”，
//! 同一连接任意时刻最多一个未完成的读取，数据块按线上顺序送达。
//! 读到零字节或出现套接字错误时退出循环，随后由拥有上下文的泵任务完成收尾：
//! 归还上下文并触发一次断开通知。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tether_core::{ConnectionId, Result, TetherError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{READ, map_io_error, peer_closed};
use crate::pool::IoContext;
use crate::state::{ConnectionState, Link};

/// 接收泵向所属引擎回报的事件。
#[async_trait]
pub(crate) trait PumpEvents: Send + Sync + 'static {
    /// 一块数据已追加到接收缓冲。
    async fn received(&self, state: &Arc<ConnectionState>) -> Result<()>;

    /// 连接已关闭；实现负责归还上下文并发出断开通知。
    async fn finished(&self, ctx: IoContext, id: ConnectionId);
}

/// 驱动单条连接直至关闭。
pub(crate) async fn run<E: PumpEvents>(events: E, mut ctx: IoContext, id: ConnectionId, link: Arc<Link>) {
    let state = Arc::clone(ctx.state());
    let fault = loop {
        let read = link.read(ctx.buffer_mut()).await;
        let n = match read {
            Ok(0) => break peer_closed(),
            Ok(n) => n,
            Err(err) => break map_io_error(READ, err),
        };
        if !state.is_current(id) {
            // 本端已经关闭，shutdown 之前读到的数据不再投递。
            break TetherError::Disconnected;
        }

        debug!(connection_id = %id, bytes = n, "received chunk");
        state.push_received(Bytes::copy_from_slice(&ctx.buffer_mut()[..n]));
        let outcome = AssertUnwindSafe(events.received(&state)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(panic) => TetherError::recoverable(panic_message(panic.as_ref())),
        };
        warn!(
            connection_id = %id,
            error = %failure,
            dropped_chunks = state.received_len(),
            "receive handler failed, buffer discarded"
        );
        state.clear_received();
    };

    debug!(connection_id = %id, code = fault.code(), reason = %fault, "receive pump stopped");
    state.close(id);
    drop(link);
    events.finished(ctx, id).await;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}

tokio::task_local! {
    /// 当前任务所属的泵计数器；只在 [`PumpTracker::spawn`] 启动的任务内可见。
    static CURRENT_TRACKER: Arc<PumpTracker>;
}

/// 统计仍在运行的接收泵，关闭流程据此等待全部连接收尾完成。
///
/// 回调运行在泵任务自身之上，因此在回调里发起的关闭不能等待当前任务：
/// [`wait_idle`](Self::wait_idle) 会把调用方所在的泵排除在外，该泵在回调返回后
/// 读到零字节并自行收尾。
#[derive(Debug, Default)]
pub(crate) struct PumpTracker {
    live: AtomicUsize,
    idle: Notify,
}

impl PumpTracker {
    pub(crate) fn enter(self: &Arc<Self>) -> PumpGuard {
        self.live.fetch_add(1, Ordering::AcqRel);
        PumpGuard {
            tracker: Arc::clone(self),
        }
    }

    /// 计数后启动泵任务，并把计数器登记为该任务的任务局部变量。
    pub(crate) fn spawn<F>(self: &Arc<Self>, pump: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.enter();
        tokio::spawn(CURRENT_TRACKER.scope(Arc::clone(self), async move {
            let _guard = guard;
            pump.await;
        }));
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 调用方是否正运行在本计数器登记的某个泵任务里。
    pub(crate) fn is_current_task(&self) -> bool {
        CURRENT_TRACKER
            .try_with(|current| std::ptr::eq(Arc::as_ptr(current), self))
            .unwrap_or(false)
    }

    /// 等待其它泵全部退出；在泵任务内调用时不等待调用方自身。
    pub(crate) async fn wait_idle(&self) {
        let own = usize::from(self.is_current_task());
        loop {
            let notified = self.idle.notified();
            if self.live() <= own {
                return;
            }
            notified.await;
        }
    }
}

/// 泵任务持有的计数守卫，任务结束（包括 panic 展开）时释放。
#[derive(Debug)]
pub(crate) struct PumpGuard {
    tracker: Arc<PumpTracker>,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::AcqRel);
        // 等待者的阈值可能是 0 或 1，每次递减都要唤醒。
        self.tracker.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"boom"), "handler panicked: boom");
        assert_eq!(
            panic_message(&String::from("bad frame")),
            "handler panicked: bad frame"
        );
        assert_eq!(panic_message(&42u8), "handler panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tracker_waits_for_all_guards() {
        let tracker = Arc::new(PumpTracker::default());
        tracker.wait_idle().await;

        let first = tracker.enter();
        let second = tracker.enter();
        assert_eq!(tracker.live(), 2);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("最后一个守卫释放后应唤醒等待者")
            .expect("等待任务未崩溃");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_inside_pump_skips_own_task() {
        let tracker = Arc::new(PumpTracker::default());
        assert!(!tracker.is_current_task());

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let inner = Arc::clone(&tracker);
        tracker.spawn(async move {
            assert!(inner.is_current_task());
            inner.wait_idle().await;
            let _ = done_tx.send(inner.live());
        });

        let live = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("泵内等待不得等待自身")
            .expect("泵任务未崩溃");
        assert_eq!(live, 1);
        tracker.wait_idle().await;
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_tracker_pump_still_waits() {
        let first = Arc::new(PumpTracker::default());
        let second = Arc::new(PumpTracker::default());
        let held = second.enter();

        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
        let other = Arc::clone(&second);
        first.spawn(async move {
            assert!(!other.is_current_task());
            other.wait_idle().await;
            let _ = done_tx.send(());
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(done_rx.try_recv().is_err(), "别的引擎的泵不能豁免等待");
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("守卫释放后应唤醒")
            .expect("泵任务未崩溃");
    }
}
