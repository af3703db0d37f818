//! 连接 ID 与发号器。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 每条已接受或已建立的连接持有的唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// 单调递增的连接 ID 发号器，第一次发号为 1。
///
/// 多个线程同时调用 [`next_id`](Self::next_id) 也不会拿到重复值；`u64` 的空间
/// 在实际连接速率下不会回绕，因此不做回绕处理。
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
    last: AtomicU64,
}

impl ConnectionIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// 最近一次发出的 ID；尚未发号时为 `None`。
    pub fn last_issued(&self) -> Option<ConnectionId> {
        match self.last.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(ConnectionId(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_id_is_one() {
        let ids = ConnectionIdGenerator::new();
        assert_eq!(ids.last_issued(), None);
        assert_eq!(ids.next_id(), ConnectionId::new(1));
        assert_eq!(ids.next_id().get(), 2);
        assert_eq!(ids.last_issued(), Some(ConnectionId::new(2)));
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let ids = Arc::new(ConnectionIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..250).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("发号线程不应 panic") {
                assert!(seen.insert(id), "重复的连接 ID: {id}");
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
