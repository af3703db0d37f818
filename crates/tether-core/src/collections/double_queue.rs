use parking_lot::Mutex;

use super::priority::{Order, PriorityQueue};

/// 读/写角色可交换的双优先队列。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让生产者持续向“追加队列”写入，而消费者从“读取队列”按优先级取出，
///   两侧只在显式的 [`swap`](Self::swap) 处交接，不需要全程加锁。
///
/// ## 逻辑 (How)
/// - 内部固定持有两个 [`PriorityQueue`]，`append_idx` 指向当前的追加角色，
///   另一个即读取角色；交换只翻转下标，存储本身从不移动；
/// - `swap` 仅在读取队列为空时翻转，否则是无副作用的空操作。
///
/// ## 契约 (What)
/// - `push`/`push_many` 只写追加队列；`pop`/`peek` 只读读取队列；
/// - 元素必须经过一次成功的 `swap` 才能被 `pop`/`peek` 观察到；
/// - 一次成功 `swap` 之后的出队序列，是上次成功交换以来全部入队元素按 [`Order`] 排序的结果；
/// - `dispose` 清空并释放两个队列，重复调用无副作用；释放后的 `push` 会被丢弃。
///
/// ## 注意事项 (Trade-offs)
/// - 本类型不做任何内部同步，跨线程共享时调用方必须串行化 `push`/`pop`/`swap`，
///   或者改用 [`SharedDoubleBufferedQueue`]。
#[derive(Debug)]
pub struct DoubleBufferedQueue<T: Ord> {
    queues: [PriorityQueue<T>; 2],
    append_idx: usize,
    order: Order,
    disposed: bool,
}

impl<T: Ord> Default for DoubleBufferedQueue<T> {
    fn default() -> Self {
        Self::new(Order::Ascending)
    }
}

impl<T: Ord> DoubleBufferedQueue<T> {
    pub fn new(order: Order) -> Self {
        Self {
            queues: [PriorityQueue::new(order), PriorityQueue::new(order)],
            append_idx: 0,
            order,
            disposed: false,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// 读取队列为空时交换两个角色，返回是否发生了交换。
    pub fn swap(&mut self) -> bool {
        if !self.read_queue().is_empty() {
            return false;
        }
        self.append_idx ^= 1;
        true
    }

    pub fn push(&mut self, item: T) {
        if self.disposed {
            return;
        }
        self.append_queue_mut().push(item);
    }

    pub fn push_many<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        if self.disposed {
            return;
        }
        let queue = self.append_queue_mut();
        for item in items {
            queue.push(item);
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.read_queue_mut().pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.read_queue().peek()
    }

    pub fn append_count(&self) -> usize {
        self.append_queue().len()
    }

    pub fn read_count(&self) -> usize {
        self.read_queue().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for queue in &mut self.queues {
            queue.clear();
            queue.release();
        }
        self.disposed = true;
    }

    fn append_queue(&self) -> &PriorityQueue<T> {
        &self.queues[self.append_idx]
    }

    fn append_queue_mut(&mut self) -> &mut PriorityQueue<T> {
        &mut self.queues[self.append_idx]
    }

    fn read_queue(&self) -> &PriorityQueue<T> {
        &self.queues[self.append_idx ^ 1]
    }

    fn read_queue_mut(&mut self) -> &mut PriorityQueue<T> {
        &mut self.queues[self.append_idx ^ 1]
    }
}

/// 以单把互斥锁包装的 [`DoubleBufferedQueue`]，供多个线程直接共享。
///
/// 每个方法都在锁内完成，`swap` 与 `pop` 之间不存在可观察的中间状态；
/// `peek` 需要克隆元素才能把结果带出锁外。
#[derive(Debug)]
pub struct SharedDoubleBufferedQueue<T: Ord> {
    inner: Mutex<DoubleBufferedQueue<T>>,
}

impl<T: Ord> Default for SharedDoubleBufferedQueue<T> {
    fn default() -> Self {
        Self::new(Order::Ascending)
    }
}

impl<T: Ord> SharedDoubleBufferedQueue<T> {
    pub fn new(order: Order) -> Self {
        Self {
            inner: Mutex::new(DoubleBufferedQueue::new(order)),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().push(item);
    }

    pub fn push_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.inner.lock().push_many(items);
    }

    pub fn swap(&self) -> bool {
        self.inner.lock().swap()
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop()
    }

    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().peek().cloned()
    }

    /// 尝试交换角色，成功后一次性按序取出读取队列的全部元素。
    ///
    /// 读取队列非空时不会交换，直接取出其中剩余的元素。
    pub fn swap_and_drain(&self) -> Vec<T> {
        let mut queue = self.inner.lock();
        queue.swap();
        let mut drained = Vec::with_capacity(queue.read_count());
        while let Some(item) = queue.pop() {
            drained.push(item);
        }
        drained
    }

    pub fn append_count(&self) -> usize {
        self.inner.lock().append_count()
    }

    pub fn read_count(&self) -> usize {
        self.inner.lock().read_count()
    }

    pub fn dispose(&self) {
        self.inner.lock().dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().is_disposed()
    }
}
