use indexmap::IndexMap;
use std::collections::HashMap;

use crate::connection::ConnectionId;

/// In-flight arranged-connection request. Owned by the `RendezvousTable`;
/// the initiator/host sides only ever hold the `host_query_id` needed to
/// look it back up, never a pointer.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub initiator: ConnectionId,
    pub host: ConnectionId,
    pub initiator_query_id: u32,
    pub host_query_id: u32,
    pub request_time_ms: u64,
}

/// Cross-referenced by initiator, host, and request id. A request is always
/// removed from all three indexes in one step.
#[derive(Default)]
pub struct RendezvousTable {
    by_host_query_id: IndexMap<u32, ConnectRequest>,
    by_initiator: HashMap<ConnectionId, Vec<u32>>,
    by_host: HashMap<ConnectionId, Vec<u32>>,
    next_host_query_id: u32,
}

impl RendezvousTable {
    pub fn new() -> Self {
        RendezvousTable::default()
    }

    pub fn create(
        &mut self,
        initiator: ConnectionId,
        host: ConnectionId,
        initiator_query_id: u32,
        now_ms: u64,
    ) -> u32 {
        let host_query_id = self.next_host_query_id;
        self.next_host_query_id = self.next_host_query_id.wrapping_add(1);

        let req = ConnectRequest {
            initiator,
            host,
            initiator_query_id,
            host_query_id,
            request_time_ms: now_ms,
        };

        self.by_initiator.entry(initiator).or_default().push(host_query_id);
        self.by_host.entry(host).or_default().push(host_query_id);
        self.by_host_query_id.insert(host_query_id, req);

        host_query_id
    }

    pub fn get(&self, host_query_id: u32) -> Option<&ConnectRequest> {
        self.by_host_query_id.get(&host_query_id)
    }

    /// Removes the request from all three indexes and returns it.
    pub fn remove(&mut self, host_query_id: u32) -> Option<ConnectRequest> {
        let req = self.by_host_query_id.shift_remove(&host_query_id)?;
        Self::remove_from_index(&mut self.by_initiator, req.initiator, host_query_id);
        Self::remove_from_index(&mut self.by_host, req.host, host_query_id);
        Some(req)
    }

    fn remove_from_index(index: &mut HashMap<ConnectionId, Vec<u32>>, key: ConnectionId, id: u32) {
        if let Some(list) = index.get_mut(&key) {
            list.retain(|&x| x != id);
            if list.is_empty() {
                index.remove(&key);
            }
        }
    }

    /// Removes and returns every request older than `max_age_ms`, matching
    /// the main loop's per-iteration sweep.
    pub fn expire_older_than(&mut self, now_ms: u64, max_age_ms: u64) -> Vec<ConnectRequest> {
        let expired: Vec<u32> = self
            .by_host_query_id
            .values()
            .filter(|r| now_ms.saturating_sub(r.request_time_ms) > max_age_ms)
            .map(|r| r.host_query_id)
            .collect();

        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_host_query_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host_query_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_removes_from_all_three_indexes() {
        let mut table = RendezvousTable::new();
        let initiator = ConnectionId(1);
        let host = ConnectionId(2);
        let id = table.create(initiator, host, 77, 0);

        assert!(table.get(id).is_some());
        let removed = table.remove(id).unwrap();
        assert_eq!(removed.initiator, initiator);
        assert!(table.get(id).is_none());
        assert!(!table.by_initiator.contains_key(&initiator));
        assert!(!table.by_host.contains_key(&host));
    }

    #[test]
    fn sweep_expires_only_old_entries() {
        let mut table = RendezvousTable::new();
        let a = table.create(ConnectionId(1), ConnectionId(2), 1, 0);
        let _b = table.create(ConnectionId(3), ConnectionId(4), 2, 4000);

        let expired = table.expire_older_than(5001, 5000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].host_query_id, a);
        assert_eq!(table.len(), 1);
    }
}
