//! 连接登记表。
//!
//! 维护两张互相引用的映射：
//! - `stations`：已注册的监听者 → 当前连接（可能为空，表示正在等待重连）与纪元号；
//! - `connections`：连接 ID → 所属监听者与“已建连”标志。
//!
//! 登记表本身不加锁，由客户端用 `parking_lot::Mutex` 包裹；所有方法都假定调用方已持锁。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Token;

use crate::listener::ListenerKey;

/// 连接标识，同时充当 `mio` 轮询令牌。
///
/// ID 在客户端生命周期内单调递增、从不复用，迟到的请求因此可以安全地按“找不到即丢弃”处理。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 一条在册连接。
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub(crate) listener: ListenerKey,
    /// 反应器在建连完成时置位，失败或关闭时清零；发送路径据此判定“已连接”。
    pub(crate) established: Arc<AtomicBool>,
}

/// 一个已注册监听者的槽位。
#[derive(Debug)]
pub(crate) struct StationSlot {
    pub(crate) connection: Option<ConnectionId>,
    /// 每次连接丢失或重试都会换新；定时任务携带纪元号，不匹配即视为过期。
    /// 纪元号取自登记表全局计数器，注销后重新注册也不会与旧任务撞号。
    pub(crate) epoch: u64,
}

#[derive(Debug)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    stations: HashMap<ListenerKey, StationSlot>,
    next_id: usize,
    next_epoch: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            stations: HashMap::new(),
            // 0 号令牌留给反应器唤醒器。
            next_id: 1,
            next_epoch: 0,
        }
    }
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 为监听者开辟槽位；已注册时返回 `None`，否则返回初始纪元号。
    pub(crate) fn open_station(&mut self, listener: &ListenerKey) -> Option<u64> {
        if self.stations.contains_key(listener) {
            return None;
        }
        let epoch = self.fresh_epoch();
        self.stations.insert(
            listener.clone(),
            StationSlot {
                connection: None,
                epoch,
            },
        );
        Some(epoch)
    }

    /// 移除槽位及其连接，返回被摘除的连接 ID（若有）；未注册时返回 `None`。
    pub(crate) fn remove_station(&mut self, listener: &ListenerKey) -> Option<Option<ConnectionId>> {
        let slot = self.stations.remove(listener)?;
        if let Some(id) = slot.connection {
            if let Some(entry) = self.connections.remove(&id) {
                entry.established.store(false, Ordering::Release);
            }
        }
        Some(slot.connection)
    }

    /// 槽位存在、当前无连接且纪元号一致时，才允许发起新的连接尝试。
    pub(crate) fn awaits_connection(&self, listener: &ListenerKey, epoch: u64) -> bool {
        self.stations
            .get(listener)
            .is_some_and(|slot| slot.connection.is_none() && slot.epoch == epoch)
    }

    /// 为等待中的槽位挂上新连接，返回分配的 ID。
    pub(crate) fn attach(
        &mut self,
        listener: &ListenerKey,
        established: Arc<AtomicBool>,
    ) -> Option<ConnectionId> {
        let slot = self.stations.get_mut(listener)?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        slot.connection = Some(id);
        self.connections.insert(
            id,
            ConnectionEntry {
                listener: listener.clone(),
                established,
            },
        );
        Some(id)
    }

    /// 摘除一条失败的连接。
    ///
    /// 监听者仍在册时返回递增后的纪元号，调用方据此安排重连；已注销则返回 `None`。
    pub(crate) fn detach_connection(&mut self, id: ConnectionId) -> Option<u64> {
        let entry = self.connections.remove(&id)?;
        entry.established.store(false, Ordering::Release);
        let epoch = self.fresh_epoch();
        let slot = self.stations.get_mut(&entry.listener)?;
        if slot.connection != Some(id) {
            return None;
        }
        slot.connection = None;
        slot.epoch = epoch;
        Some(epoch)
    }

    /// 连接尝试在交给反应器之前就失败时推进纪元号。
    pub(crate) fn retry_epoch(&mut self, listener: &ListenerKey, epoch: u64) -> Option<u64> {
        if !self.awaits_connection(listener, epoch) {
            return None;
        }
        let next = self.fresh_epoch();
        let slot = self.stations.get_mut(listener)?;
        slot.epoch = next;
        Some(next)
    }

    fn fresh_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    pub(crate) fn contains_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// 返回监听者当前的连接 ID 与是否已完成建连。
    pub(crate) fn connection_of(&self, listener: &ListenerKey) -> Option<(ConnectionId, bool)> {
        let id = self.stations.get(listener)?.connection?;
        let entry = self.connections.get(&id)?;
        Some((id, entry.established.load(Ordering::Acquire)))
    }

    pub(crate) fn is_registered(&self, listener: &ListenerKey) -> bool {
        self.stations.contains_key(listener)
    }

    pub(crate) fn station_count(&self) -> usize {
        self.stations.len()
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::test_support::listener;

    fn key(name: &'static str) -> ListenerKey {
        ListenerKey::new(listener(name))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        let a = key("a");
        assert!(registry.open_station(&a).is_some());
        assert_eq!(registry.open_station(&a), None);
        assert_eq!(registry.station_count(), 1);
    }

    #[test]
    fn re_registration_never_revives_earlier_epochs() {
        let mut registry = Registry::new();
        let a = key("a");
        let first = registry.open_station(&a).expect("新槽位");
        let pending = registry.retry_epoch(&a, first).expect("纪元一致");

        assert_eq!(registry.remove_station(&a), Some(None));
        let reopened = registry.open_station(&a).expect("重新注册");
        assert_ne!(reopened, first);
        assert_ne!(reopened, pending);
        assert!(!registry.awaits_connection(&a, first));
        assert!(!registry.awaits_connection(&a, pending));
        assert!(registry.awaits_connection(&a, reopened));

        // 重新注册后的重试同样不会落回旧纪元。
        let retried = registry.retry_epoch(&a, reopened).expect("纪元一致");
        assert!(retried > pending);
    }

    #[test]
    fn ids_are_never_reused_and_skip_the_waker_token() {
        let mut registry = Registry::new();
        let a = key("a");
        registry.open_station(&a);

        let first = registry
            .attach(&a, Arc::new(AtomicBool::new(false)))
            .expect("槽位存在");
        assert_ne!(first.token(), Token(0));
        let epoch = registry.detach_connection(first).expect("仍在册");
        assert!(registry.awaits_connection(&a, epoch));

        let second = registry
            .attach(&a, Arc::new(AtomicBool::new(false)))
            .expect("槽位存在");
        assert!(second > first);
        assert_eq!(ConnectionId::from_token(second.token()), second);
    }

    #[test]
    fn stale_epoch_is_not_awaiting() {
        let mut registry = Registry::new();
        let a = key("a");
        let initial = registry.open_station(&a).expect("新槽位");
        let next = registry.retry_epoch(&a, initial).expect("纪元一致");
        assert!(!registry.awaits_connection(&a, initial));
        assert!(registry.awaits_connection(&a, next));
        assert_eq!(registry.retry_epoch(&a, initial), None);
    }

    #[test]
    fn removal_clears_established_flag_and_orphans_the_connection() {
        let mut registry = Registry::new();
        let a = key("a");
        registry.open_station(&a);
        let flag = Arc::new(AtomicBool::new(true));
        let id = registry.attach(&a, Arc::clone(&flag)).expect("槽位存在");
        assert_eq!(registry.connection_of(&a), Some((id, true)));

        assert_eq!(registry.remove_station(&a), Some(Some(id)));
        assert!(!flag.load(Ordering::Acquire));
        assert!(!registry.contains_connection(id));
        assert_eq!(registry.detach_connection(id), None);
        assert_eq!(registry.remove_station(&a), None);
        assert_eq!(registry.connection_count(), 0);
    }
}
