//! # ConnectionTable：服务端活跃连接仓储
//!
//! ## 核心意图（Why）
//! - 以连接 ID 索引当前所有活跃连接，供广播、按 ID 查找与引擎关闭时的批量断开使用；
//! - 单一 `DashMap` 承担全部变更：插入、替换与移除都在同一分片锁内原子完成，
//!   不存在“两把锁各管一半”导致的重复断开通知。
//!
//! ## 行为契约（What）
//! - `insert`：同 ID 已存在时返回被替换的旧状态，由调用方走旧连接的关闭路径；
//! - `remove_if_current`：只有当表内条目仍指向给定状态时才移除，
//!   过期的关闭请求不会误删同 ID 的新条目；
//! - `snapshot`：复制一份 `(ID, 状态)` 列表，遍历期间不持有任何分片锁；
//! - 引擎发起的关闭在状态迁移到 `Closed` 后立即移除条目；对端先行关闭时，
//!   条目在接收泵收尾的第一步移除，两者之间只有同一任务内的极短窗口。
//!
//! ## 风险提示（Trade-offs）
//! - 快照是时间点视图：遍历过程中新接入的连接不会出现，已断开的连接发送时会得到 `Disconnected`。

use std::sync::Arc;

use dashmap::DashMap;
use tether_core::ConnectionId;

use crate::state::ConnectionState;

#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, Arc<ConnectionState>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，返回同 ID 下被替换的旧状态。
    pub(crate) fn insert(
        &self,
        id: ConnectionId,
        state: Arc<ConnectionState>,
    ) -> Option<Arc<ConnectionState>> {
        self.entries.insert(id, state)
    }

    /// 仅当条目仍指向 `state` 时移除。
    pub(crate) fn remove_if_current(&self, id: ConnectionId, state: &Arc<ConnectionState>) -> bool {
        self.entries
            .remove_if(&id, |_, current| Arc::ptr_eq(current, state))
            .is_some()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 当前全部 ID，按升序排列。
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// 复制当前所有条目，供广播等需要遍历的场景使用。
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<ConnectionState>)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(slot: usize) -> Arc<ConnectionState> {
        Arc::new(ConnectionState::new(slot))
    }

    #[test]
    fn insert_reports_replaced_entry() {
        let table = ConnectionTable::new();
        let old = state(0);
        let new = state(1);
        assert!(table.insert(ConnectionId::new(1), Arc::clone(&old)).is_none());

        let replaced = table
            .insert(ConnectionId::new(1), Arc::clone(&new))
            .expect("同 ID 注册必须返回旧条目");
        assert!(Arc::ptr_eq(&replaced, &old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_removal_keeps_new_entry() {
        let table = ConnectionTable::new();
        let old = state(0);
        let new = state(1);
        table.insert(ConnectionId::new(9), Arc::clone(&old));
        table.insert(ConnectionId::new(9), Arc::clone(&new));

        assert!(!table.remove_if_current(ConnectionId::new(9), &old));
        assert!(table.contains(ConnectionId::new(9)));
        assert!(table.remove_if_current(ConnectionId::new(9), &new));
        assert!(!table.remove_if_current(ConnectionId::new(9), &new), "第二次移除必须是空操作");
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_and_ids_cover_all_entries() {
        let table = ConnectionTable::new();
        for raw in [3u64, 1, 2] {
            table.insert(ConnectionId::new(raw), state(raw as usize));
        }
        assert_eq!(
            table.ids(),
            vec![ConnectionId::new(1), ConnectionId::new(2), ConnectionId::new(3)]
        );
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(
            snapshot
                .iter()
                .all(|(id, state)| Arc::ptr_eq(state, &table.get(*id).expect("条目存在")))
        );
    }
}
