use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tether_core::{ExhaustionPolicy, Result, TetherError};
use tokio::sync::Notify;
use tracing::warn;

use crate::state::ConnectionState;

/// 一次连接租约：固定大小的接收缓冲与其所属的连接状态。
///
/// 上下文只能通过 [`IoContextPool::pop`] 获得，所有权即租约；归还后缓冲内容在逻辑上失效，
/// 但不会被清零。
#[derive(Debug)]
pub struct IoContext {
    slot: usize,
    buffer: Box<[u8]>,
    state: Arc<ConnectionState>,
}

impl IoContext {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// 池计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub leased: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub failed_acquisitions: u64,
}

/// `IoContextPool` 是固定容量的 I/O 上下文竞技场，配合自由链表复用连接资源。
///
/// # 模块角色（Why）
/// - 服务端在启动时一次性分配 `capacity` 份接收缓冲与 [`ConnectionState`]，
///   之后的建连/断连只在自由链表上移动所有权，不触发堆分配；
/// - 池容量同时是并发连接数的硬上限。
///
/// # 核心机制（How）
/// - `parking_lot::Mutex` 保护自由链表与租借位图，`pop`/`push` 互斥执行；
/// - 租借位图按槽位记录“已借出”，同一槽位的第二次归还被拒绝并记录告警；
/// - `Wait` 策略下借用方挂在 `tokio::sync::Notify` 上，归还时唤醒一个等待者。
///
/// # 契约说明（What）
/// - `push` 会先调用 [`ConnectionState::init`] 再放回自由链表；
/// - `dispose` 后的 `pop` 返回 [`TetherError::EngineStopped`]，迟到的归还只重置状态不再复用；
/// - `available() + 已借出数 == capacity()` 在任何时刻成立（释放后除外）。
///
/// # 设计权衡（Trade-offs）
/// - 全局一把锁而非分片：临界区只有一次 `Vec::pop`/`Vec::push`，争用远小于套接字开销。
#[derive(Debug)]
pub struct IoContextPool {
    capacity: usize,
    buffer_size: usize,
    policy: ExhaustionPolicy,
    states: Vec<Arc<ConnectionState>>,
    inner: Mutex<PoolInner>,
    returned: Notify,
    metrics: PoolMetrics,
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<IoContext>,
    leased: Vec<bool>,
    disposed: bool,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    acquired: AtomicU64,
    released: AtomicU64,
    failed: AtomicU64,
}

impl IoContextPool {
    /// 预分配 `capacity` 个上下文，每个携带 `buffer_size` 字节的接收缓冲。
    pub fn new(capacity: usize, buffer_size: usize, policy: ExhaustionPolicy) -> Result<Self> {
        if capacity == 0 || buffer_size == 0 {
            return Err(TetherError::Config {
                reason: format!(
                    "io context pool needs non-zero capacity and buffer size (got {capacity}/{buffer_size})"
                ),
            });
        }

        let states: Vec<_> = (0..capacity)
            .map(|slot| Arc::new(ConnectionState::new(slot)))
            .collect();
        // 反向入栈，使得首次借出的是 0 号槽位。
        let free = states
            .iter()
            .rev()
            .map(|state| IoContext {
                slot: state.slot(),
                buffer: vec![0u8; buffer_size].into_boxed_slice(),
                state: Arc::clone(state),
            })
            .collect();

        Ok(Self {
            capacity,
            buffer_size,
            policy,
            states,
            inner: Mutex::new(PoolInner {
                free,
                leased: vec![false; capacity],
                disposed: false,
            }),
            returned: Notify::new(),
            metrics: PoolMetrics::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// 按槽位查看连接状态，不影响租约。
    pub fn state(&self, slot: usize) -> Option<&Arc<ConnectionState>> {
        self.states.get(slot)
    }

    /// 立即尝试借出一个上下文，耗尽时不等待。
    pub fn try_pop(&self) -> Result<IoContext> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(TetherError::EngineStopped);
        }
        match inner.free.pop() {
            Some(ctx) => {
                inner.leased[ctx.slot] = true;
                self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(ctx)
            }
            None => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                Err(TetherError::PoolExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// 按耗尽策略借出上下文：`Fail` 立即报错，`Wait` 挂起直到有上下文被归还。
    pub async fn pop(&self) -> Result<IoContext> {
        loop {
            // 先登记等待再检查自由链表，归还发生在两者之间也不会丢失唤醒。
            let notified = self.returned.notified();
            match self.try_pop() {
                Err(TetherError::PoolExhausted { .. })
                    if self.policy == ExhaustionPolicy::Wait =>
                {
                    notified.await;
                }
                other => return other,
            }
        }
    }

    /// 归还上下文；重复归还或外来上下文返回 `false` 且不改变池状态。
    pub fn push(&self, ctx: IoContext) -> bool {
        let mut inner = self.inner.lock();
        if inner.leased.get(ctx.slot).copied() != Some(true)
            || !Arc::ptr_eq(&self.states[ctx.slot], &ctx.state)
        {
            warn!(slot = ctx.slot, "rejected io context that is not on lease");
            return false;
        }

        ctx.state.init();
        inner.leased[ctx.slot] = false;
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        if inner.disposed {
            return false;
        }
        inner.free.push(ctx);
        drop(inner);
        self.returned.notify_one();
        true
    }

    /// 释放所有空闲上下文并断开所有仍在使用的连接；可重复调用。
    pub fn dispose(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.free.clear();
        }
        for state in &self.states {
            state.init();
        }
        self.returned.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            capacity: self.capacity,
            available: inner.free.len(),
            leased: inner.leased.iter().filter(|leased| **leased).count(),
            total_acquired: self.metrics.acquired.load(Ordering::Relaxed),
            total_released: self.metrics.released.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed.load(Ordering::Relaxed),
        }
    }
}
