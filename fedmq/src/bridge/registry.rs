use std::fmt;

use parking_lot::Mutex;
use serde_json::json;

use fedmq_utils::Counter;

use crate::error::BrokerError;
use crate::types::{timestamp_millis, BrokerId, DestinationName, HashMap, HashSet, TimestampMillis};

#[derive(Debug, Clone)]
pub struct BridgeEntry {
    pub connector: String,
    pub network_ttl: u32,
    pub destinations: HashSet<DestinationName>,
    //brokers the remote reported as reachable through it, from its handshake
    pub network_path: Vec<BrokerId>,
    pub created_at: TimestampMillis,
}

/// Active bridges of one broker, at most one per remote broker.
pub struct BridgeRegistry {
    local: BrokerId,
    entries: Mutex<HashMap<BrokerId, BridgeEntry>>,
    active: Counter,
}

impl fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BridgeRegistry {{ local: {}, active: {:?} }}", self.local, self.active)
    }
}

impl BridgeRegistry {
    pub fn new(local: BrokerId) -> Self {
        Self { local, entries: Mutex::new(HashMap::default()), active: Counter::new() }
    }

    /// Claims the slot for `remote`, refusing a second bridge to the same broker and any bridge
    /// back to this broker itself.
    pub fn try_register(&self, remote: BrokerId, connector: &str, network_ttl: u32) -> Result<(), BrokerError> {
        if remote == self.local {
            return Err(BrokerError::LoopDetected { local: self.local, remote });
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&remote) {
            return Err(BrokerError::DuplicateBridge(remote));
        }
        entries.insert(
            remote,
            BridgeEntry {
                connector: connector.into(),
                network_ttl,
                destinations: HashSet::default(),
                network_path: Vec::new(),
                created_at: timestamp_millis(),
            },
        );
        self.active.inc();
        Ok(())
    }

    pub fn unregister(&self, remote: BrokerId) -> Option<BridgeEntry> {
        let removed = self.entries.lock().remove(&remote);
        if removed.is_some() {
            self.active.dec();
        }
        removed
    }

    #[inline]
    pub fn contains(&self, remote: BrokerId) -> bool {
        self.entries.lock().contains_key(&remote)
    }

    /// Records that `destination` is bridged to `remote`. Returns `false` if it already was,
    /// or if there is no bridge to `remote`.
    pub fn mark_destination(&self, remote: BrokerId, destination: &DestinationName) -> bool {
        self.entries.lock().get_mut(&remote).map(|e| e.destinations.insert(destination.clone())).unwrap_or(false)
    }

    pub fn unmark_destination(&self, remote: BrokerId, destination: &str) -> bool {
        self.entries.lock().get_mut(&remote).map(|e| e.destinations.remove(destination)).unwrap_or(false)
    }

    /// Stores the path `remote` announced during its handshake, minus this broker.
    pub fn set_network_path(&self, remote: BrokerId, path: &[BrokerId]) {
        if let Some(e) = self.entries.lock().get_mut(&remote) {
            e.network_path = path.iter().copied().filter(|id| *id != self.local).collect();
        }
    }

    /// Brokers reachable from here without going through `except`: every other bridged remote
    /// and whatever lies behind it. Sent to `except` in the handshake, which refuses the bridge
    /// when it finds itself in the path.
    pub fn network_path(&self, except: BrokerId) -> Vec<BrokerId> {
        let entries = self.entries.lock();
        let mut path: Vec<BrokerId> = entries
            .iter()
            .filter(|(remote, _)| **remote != except)
            .flat_map(|(remote, e)| std::iter::once(*remote).chain(e.network_path.iter().copied()))
            .filter(|id| *id != self.local)
            .collect();
        path.sort_unstable();
        path.dedup();
        path
    }

    #[inline]
    pub fn is_bridged(&self, remote: BrokerId, destination: &str) -> bool {
        self.entries.lock().get(&remote).map(|e| e.destinations.contains(destination)).unwrap_or(false)
    }

    #[inline]
    pub fn entry(&self, remote: BrokerId) -> Option<BridgeEntry> {
        self.entries.lock().get(&remote).cloned()
    }

    #[inline]
    pub fn remotes(&self) -> Vec<BrokerId> {
        let mut remotes: Vec<_> = self.entries.lock().keys().copied().collect();
        remotes.sort_unstable();
        remotes
    }

    #[inline]
    pub fn active(&self) -> &Counter {
        &self.active
    }

    pub fn to_json(&self) -> serde_json::Value {
        let entries = self.entries.lock();
        let bridges = entries
            .iter()
            .map(|(remote, e)| {
                let mut destinations: Vec<_> = e.destinations.iter().map(|d| d.to_string()).collect();
                destinations.sort();
                json!({
                    "remote": remote,
                    "connector": e.connector,
                    "network_ttl": e.network_ttl,
                    "destinations": destinations,
                    "network_path": e.network_path,
                    "created_at": fedmq_utils::format_timestamp_millis(e.created_at),
                })
            })
            .collect::<Vec<_>>();
        json!({
            "active": self.active.to_json(),
            "bridges": bridges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_bridge_per_remote() {
        let r = BridgeRegistry::new(1);
        r.try_register(2, "network1", 3).unwrap();
        assert!(matches!(r.try_register(2, "network2", 3), Err(BrokerError::DuplicateBridge(2))));
        assert!(matches!(r.try_register(1, "network1", 3), Err(BrokerError::LoopDetected { local: 1, remote: 1 })));
        r.try_register(3, "network1", 3).unwrap();
        assert_eq!(r.remotes(), vec![2, 3]);
        assert_eq!(r.active().count(), 2);

        assert!(r.unregister(2).is_some());
        assert!(r.unregister(2).is_none());
        assert_eq!(r.active().count(), 1);
        assert_eq!(r.active().max(), 2);
        r.try_register(2, "network1", 3).unwrap();
    }

    #[test]
    fn destinations_bridged_once() {
        let r = BridgeRegistry::new(1);
        let orders = DestinationName::from("orders");
        assert!(!r.mark_destination(2, &orders));
        r.try_register(2, "network1", 3).unwrap();
        assert!(r.mark_destination(2, &orders));
        assert!(!r.mark_destination(2, &orders));
        assert!(r.is_bridged(2, "orders"));
        assert_eq!(r.to_json()["bridges"][0]["destinations"][0], "orders");
        assert!(r.unmark_destination(2, "orders"));
        assert!(!r.is_bridged(2, "orders"));
    }

    #[test]
    fn network_path_excludes_the_asking_remote() {
        let r = BridgeRegistry::new(2);
        r.try_register(1, "network1", 3).unwrap();
        r.try_register(3, "network1", 3).unwrap();
        assert_eq!(r.network_path(3), vec![1]);

        //4 sits behind 1, and 2 itself is never reported back
        r.set_network_path(1, &[4, 2]);
        assert_eq!(r.entry(1).unwrap().network_path, vec![4]);
        assert_eq!(r.network_path(3), vec![1, 4]);
        assert_eq!(r.network_path(1), vec![3]);
        r.set_network_path(3, &[4]);
        assert_eq!(r.network_path(5), vec![1, 3, 4]);

        //1 is also reachable through 3, which 1 has to hear about
        r.set_network_path(3, &[1]);
        assert_eq!(r.network_path(1), vec![1, 3]);

        r.unregister(1);
        assert_eq!(r.network_path(3), Vec::<BrokerId>::new());
        r.set_network_path(1, &[4]);
        assert!(r.entry(1).is_none());
    }
}
