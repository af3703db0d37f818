//! DoubleBufferedQueue 性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：以随机操作序列驱动双缓冲队列，并与一个“影子模型”逐步比对，
//!   验证三条性质：元素只有在一次成功交换之后才可见；读取队列非空时交换是空操作；
//!   成功交换后的出队序列按配置顺序有序。
//! - **设计手法 (How)**：影子模型用两个 `Vec` 表示追加/读取角色，交换时对读取侧排序，
//!   不依赖任何堆实现，因此与被测代码相互独立。
//! - **边界 (What)**：元素取值范围刻意收窄（`0..32`），以便序列中出现大量重复值。

use proptest::prelude::*;
use tether_core::{DoubleBufferedQueue, Order};

#[derive(Clone, Debug)]
enum Op {
    Push(u8),
    PushMany(Vec<u8>),
    Pop,
    Peek,
    Swap,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..32).prop_map(Op::Push),
        1 => prop::collection::vec(0u8..32, 0..6).prop_map(Op::PushMany),
        3 => Just(Op::Pop),
        1 => Just(Op::Peek),
        2 => Just(Op::Swap),
    ]
}

fn order() -> impl Strategy<Value = Order> {
    prop_oneof![Just(Order::Ascending), Just(Order::Descending)]
}

/// 影子模型：读取侧始终按出队顺序保存，队首即下一个出队元素。
struct Model {
    append: Vec<u8>,
    read: Vec<u8>,
    order: Order,
}

impl Model {
    fn new(order: Order) -> Self {
        Self {
            append: Vec::new(),
            read: Vec::new(),
            order,
        }
    }

    fn swap(&mut self) -> bool {
        if !self.read.is_empty() {
            return false;
        }
        std::mem::swap(&mut self.append, &mut self.read);
        match self.order {
            Order::Ascending => self.read.sort_unstable(),
            Order::Descending => self.read.sort_unstable_by(|a, b| b.cmp(a)),
        }
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.read.is_empty() {
            None
        } else {
            Some(self.read.remove(0))
        }
    }
}

proptest! {
    #[test]
    fn prop_queue_matches_shadow_model(order in order(), ops in prop::collection::vec(op(), 0..64)) {
        let mut queue = DoubleBufferedQueue::new(order);
        let mut model = Model::new(order);

        for op in ops {
            match op {
                Op::Push(item) => {
                    queue.push(item);
                    model.append.push(item);
                }
                Op::PushMany(items) => {
                    model.append.extend(items.iter().copied());
                    queue.push_many(items);
                }
                Op::Pop => prop_assert_eq!(queue.pop(), model.pop()),
                Op::Peek => prop_assert_eq!(queue.peek().copied(), model.read.first().copied()),
                Op::Swap => {
                    let read_before = queue.read_count();
                    let append_before = queue.append_count();
                    let swapped = queue.swap();
                    prop_assert_eq!(swapped, model.swap());
                    if !swapped {
                        prop_assert_eq!(queue.read_count(), read_before);
                        prop_assert_eq!(queue.append_count(), append_before);
                    }
                }
            }
            prop_assert_eq!(queue.append_count(), model.append.len());
            prop_assert_eq!(queue.read_count(), model.read.len());
        }
    }

    #[test]
    fn prop_pop_after_swap_is_sorted(order in order(), items in prop::collection::vec(any::<i32>(), 0..128)) {
        let mut queue = DoubleBufferedQueue::new(order);
        queue.push_many(items.iter().copied());
        prop_assert!(queue.pop().is_none());
        prop_assert!(queue.swap());

        let mut popped = Vec::with_capacity(items.len());
        while let Some(item) = queue.pop() {
            popped.push(item);
        }
        let mut expected = items.clone();
        match order {
            Order::Ascending => expected.sort_unstable(),
            Order::Descending => expected.sort_unstable_by(|a, b| b.cmp(a)),
        }
        prop_assert_eq!(popped, expected);
    }

    #[test]
    fn prop_dispose_is_idempotent(items in prop::collection::vec(any::<u16>(), 0..32), swap_first in any::<bool>()) {
        let mut queue = DoubleBufferedQueue::new(Order::Ascending);
        queue.push_many(items);
        if swap_first {
            queue.swap();
        }
        queue.dispose();
        prop_assert_eq!(queue.read_count() + queue.append_count(), 0);
        queue.dispose();
        prop_assert!(queue.is_disposed());
        prop_assert_eq!(queue.read_count() + queue.append_count(), 0);
    }
}

#[test]
fn ascending_int_queue_scenario() {
    let mut queue = DoubleBufferedQueue::<i32>::new(Order::Ascending);
    queue.push(5);
    queue.push(3);
    queue.push(8);
    assert!(queue.swap(), "读取队列自构造起为空，交换必须成功");
    assert_eq!(queue.pop(), Some(3));
    assert_eq!(queue.pop(), Some(5));
    assert_eq!(queue.pop(), Some(8));
}
