//! 生产者/消费者解耦用的集合原语。

mod double_queue;
mod priority;

pub use double_queue::{DoubleBufferedQueue, SharedDoubleBufferedQueue};
pub use priority::{Order, PriorityQueue};
