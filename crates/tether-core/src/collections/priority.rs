use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// 出队顺序。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// 最小元素先出队。
    #[default]
    Ascending,
    /// 最大元素先出队。
    Descending,
}

/// 按 [`Order`] 出队的二叉堆。
///
/// 标准库的 `BinaryHeap` 是最大堆；升序时以 `Reverse` 包装元素得到最小堆。
/// 两种形态共用同一组方法，调用方无需关心内部表示。
#[derive(Clone, Debug)]
pub struct PriorityQueue<T: Ord> {
    heap: Heap<T>,
}

#[derive(Clone, Debug)]
enum Heap<T: Ord> {
    Min(BinaryHeap<Reverse<T>>),
    Max(BinaryHeap<T>),
}

impl<T: Ord> PriorityQueue<T> {
    pub fn new(order: Order) -> Self {
        let heap = match order {
            Order::Ascending => Heap::Min(BinaryHeap::new()),
            Order::Descending => Heap::Max(BinaryHeap::new()),
        };
        Self { heap }
    }

    pub fn order(&self) -> Order {
        match self.heap {
            Heap::Min(_) => Order::Ascending,
            Heap::Max(_) => Order::Descending,
        }
    }

    pub fn push(&mut self, item: T) {
        match &mut self.heap {
            Heap::Min(heap) => heap.push(Reverse(item)),
            Heap::Max(heap) => heap.push(item),
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        match &mut self.heap {
            Heap::Min(heap) => heap.pop().map(|Reverse(item)| item),
            Heap::Max(heap) => heap.pop(),
        }
    }

    pub fn peek(&self) -> Option<&T> {
        match &self.heap {
            Heap::Min(heap) => heap.peek().map(|Reverse(item)| item),
            Heap::Max(heap) => heap.peek(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.heap {
            Heap::Min(heap) => heap.len(),
            Heap::Max(heap) => heap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match &mut self.heap {
            Heap::Min(heap) => heap.clear(),
            Heap::Max(heap) => heap.clear(),
        }
    }

    /// 清空并归还底层存储。
    pub(crate) fn release(&mut self) {
        match &mut self.heap {
            Heap::Min(heap) => *heap = BinaryHeap::new(),
            Heap::Max(heap) => *heap = BinaryHeap::new(),
        }
    }
}
