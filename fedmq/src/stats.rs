//! Per-destination statistics bundle
//!
//! A [`DestinationStatistics`] owns one [`Statistic`] per tracked metric of a destination. The
//! broker keeps a bundle of the same shape as the rollup every destination reports into, and a
//! destination can be rebound to another aggregate (or detached) at any time.
//!
//! `consumers`, `producers`, `messages` and `messagesCached` are live gauges: a reset leaves
//! them alone. `expired` is always enabled, so expiry is accounted for even while the rest of
//! the bundle is switched off.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;
use serde_json::json;

use crate::error::BrokerError;
use crate::statistic::{StatId, Statistic, StatisticKind, StatisticSnapshot, StatisticTree};

pub struct DestinationStatistics {
    tree: StatisticTree,
    enabled: AtomicBool,
    do_reset: AtomicBool,

    pub enqueues: Statistic,
    pub dispatched: Statistic,
    pub dequeues: Statistic,
    pub forwards: Statistic,
    pub duplicate_from_store: Statistic,
    pub inflight: Statistic,
    pub expired: Statistic,
    pub process_time: Statistic,
    pub blocked_sends: Statistic,
    pub blocked_time: Statistic,
    pub message_size: Statistic,
    pub max_uncommitted_exceeded_count: Statistic,
    pub network_enqueues: Statistic,
    pub network_dequeues: Statistic,

    pub consumers: Statistic,
    pub producers: Statistic,
    pub messages: Statistic,
    pub messages_cached: Statistic,
}

impl fmt::Debug for DestinationStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestinationStatistics {}", self.to_json())
    }
}

impl DestinationStatistics {
    pub fn new(tree: &StatisticTree) -> Self {
        use StatisticKind::*;
        let stat = |name: &str, desc: &str, kind| tree.create(name, desc, kind);
        let gauge = |name: &str, desc: &str, kind| {
            let s = tree.create(name, desc, kind);
            s.set_do_reset(false);
            s
        };
        Self {
            tree: tree.clone(),
            enabled: AtomicBool::new(true),
            do_reset: AtomicBool::new(true),
            enqueues: stat("enqueues", "The number of messages that have been sent to the destination", Count),
            dispatched: stat("dispatched", "The number of messages that have been dispatched from the destination", Count),
            dequeues: stat("dequeues", "The number of messages that have been acknowledged from the destination", Count),
            forwards: stat("forwards", "The number of messages that have been forwarded to a networked broker", Count),
            duplicate_from_store: stat(
                "duplicateFromStore",
                "The number of duplicate messages that have been paged-in from the store",
                Count,
            ),
            inflight: stat(
                "inflight",
                "The number of messages dispatched but awaiting acknowledgement",
                Count,
            ),
            expired: stat("expired", "The number of messages that have expired", Count),
            process_time: stat("processTime", "Information around length of time messages are held by a destination", Time),
            blocked_sends: stat("blockedSends", "Number of messages that have to wait for flow control", Count),
            blocked_time: stat("blockedTime", "Amount of time messages are blocked for flow control", Time),
            message_size: stat("messageSize", "Size of messages passing through the destination", Size),
            max_uncommitted_exceeded_count: stat(
                "maxUncommittedExceededCount",
                "Number of times maxUncommittedCount has been exceeded",
                Count,
            ),
            network_enqueues: stat(
                "networkEnqueues",
                "The number of messages that have been sent to the destination via network connection",
                Count,
            ),
            network_dequeues: stat(
                "networkDequeues",
                "The number of messages that have been acknowledged from the destination via network connection",
                Count,
            ),
            consumers: gauge("consumers", "The number of consumers that that are subscribing to messages", Count),
            producers: gauge("producers", "The number of producers that that are publishing messages", Count),
            messages: gauge("messages", "The number of messages that that are being held by the destination", Count),
            messages_cached: gauge("messagesCached", "The number of messages that are held in the destination's memory cache", PollCount),
        }
    }

    #[inline]
    pub fn tree(&self) -> &StatisticTree {
        &self.tree
    }

    /// Every owned statistic, in a stable order.
    pub fn statistics(&self) -> [&Statistic; 18] {
        [
            &self.enqueues,
            &self.dispatched,
            &self.dequeues,
            &self.forwards,
            &self.duplicate_from_store,
            &self.inflight,
            &self.expired,
            &self.process_time,
            &self.blocked_sends,
            &self.blocked_time,
            &self.message_size,
            &self.max_uncommitted_exceeded_count,
            &self.network_enqueues,
            &self.network_dequeues,
            &self.consumers,
            &self.producers,
            &self.messages,
            &self.messages_cached,
        ]
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Statistic> {
        self.statistics().into_iter().find(|s| s.snapshot().map(|snap| snap.name == name).unwrap_or(false))
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        for s in self.statistics() {
            s.set_enabled(enabled);
        }
        self.expired.set_enabled(true);
    }

    #[inline]
    pub fn is_do_reset(&self) -> bool {
        self.do_reset.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_do_reset(&self, do_reset: bool) {
        self.do_reset.store(do_reset, Ordering::SeqCst);
    }

    /// Zeroes every resettable statistic, if resets are switched on for this bundle.
    pub fn reset(&self) {
        if !self.is_do_reset() {
            log::debug!("statistics reset ignored, resets are disabled");
            return;
        }
        for s in self.statistics() {
            s.reset();
        }
    }

    /// Points every statistic of this bundle at the same-named statistic of `parent`,
    /// or detaches them all when `parent` is `None`.
    pub fn set_parent(&self, parent: Option<&DestinationStatistics>) -> Result<(), BrokerError> {
        let bindings: Vec<(StatId, Option<StatId>)> = match parent {
            Some(parent) => {
                if !self.tree.same_tree(&parent.tree) {
                    return Err(BrokerError::InvalidParent("parent belongs to another statistics tree".into()));
                }
                self.statistics()
                    .into_iter()
                    .zip(parent.statistics())
                    .map(|(child, parent)| (child.id(), Some(parent.id())))
                    .collect()
            }
            None => self.statistics().into_iter().map(|child| (child.id(), None)).collect(),
        };
        self.tree.rebind(&bindings)
    }

    pub fn snapshot(&self) -> Vec<StatisticSnapshot> {
        self.statistics().into_iter().filter_map(|s| s.snapshot()).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let stats = self.snapshot().into_iter().map(|s| (s.name.clone(), s.to_json())).collect_vec();
        json!({
            "enabled": self.is_enabled(),
            "statistics": serde_json::Map::from_iter(stats),
        })
    }
}

impl Drop for DestinationStatistics {
    fn drop(&mut self) {
        for s in self.statistics() {
            self.tree.remove(s.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::statistic::Update;

    #[test]
    fn rollup_sums_children() {
        let tree = StatisticTree::new();
        let broker = DestinationStatistics::new(&tree);
        let a = DestinationStatistics::new(&tree);
        let b = DestinationStatistics::new(&tree);
        a.set_parent(Some(&broker)).unwrap();
        b.set_parent(Some(&broker)).unwrap();

        a.enqueues.increment(5);
        b.enqueues.increment(7);
        a.consumers.increment(1);
        b.process_time.add_time(Duration::from_millis(4));
        assert_eq!(broker.enqueues.value(), 12);
        assert_eq!(broker.consumers.value(), 1);
        assert_eq!(broker.process_time.sample().count, 1);

        a.set_parent(None).unwrap();
        a.enqueues.increment(1);
        assert_eq!(broker.enqueues.value(), 12);
    }

    #[test]
    fn reset_keeps_gauges() {
        let tree = StatisticTree::new();
        let s = DestinationStatistics::new(&tree);
        s.enqueues.increment(3);
        s.consumers.increment(2);
        s.messages.increment(3);
        s.reset();
        assert_eq!(s.enqueues.value(), 0);
        assert_eq!(s.consumers.value(), 2);
        assert_eq!(s.messages.value(), 3);

        s.enqueues.increment(1);
        s.set_do_reset(false);
        s.reset();
        assert_eq!(s.enqueues.value(), 1);
    }

    #[test]
    fn disable_keeps_expired() {
        let tree = StatisticTree::new();
        let s = DestinationStatistics::new(&tree);
        s.set_enabled(false);
        assert!(!s.is_enabled());
        assert_eq!(s.enqueues.increment(1), Update::StatisticsDisabled);
        assert_eq!(s.blocked_sends.increment(1), Update::StatisticsDisabled);
        assert_eq!(s.consumers.increment(1), Update::StatisticsDisabled);
        assert_eq!(s.expired.increment(1), Update::Applied);
        assert_eq!(s.expired.value(), 1);

        s.set_enabled(true);
        assert_eq!(s.enqueues.increment(1), Update::Applied);
    }

    #[test]
    fn rebinding_under_load_loses_nothing() {
        let tree = StatisticTree::new();
        let east = DestinationStatistics::new(&tree);
        let west = DestinationStatistics::new(&tree);
        let child = DestinationStatistics::new(&tree);
        child.set_parent(Some(&east)).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..2500 {
                        child.enqueues.increment(1);
                    }
                });
            }
            scope.spawn(|| {
                for i in 0..200 {
                    let parent = if i % 2 == 0 { &west } else { &east };
                    child.set_parent(Some(parent)).unwrap();
                }
            });
        });

        //every update landed on exactly one of the two parents
        assert_eq!(child.enqueues.value(), 10_000);
        assert_eq!(east.enqueues.value() + west.enqueues.value(), 10_000);
    }

    #[test]
    fn rejects_foreign_parent() {
        let s = DestinationStatistics::new(&StatisticTree::new());
        let other = DestinationStatistics::new(&StatisticTree::new());
        assert!(s.set_parent(Some(&other)).is_err());
    }

    #[test]
    fn drop_removes_nodes() {
        let tree = StatisticTree::new();
        {
            let s = DestinationStatistics::new(&tree);
            assert_eq!(tree.len(), 18);
            assert!(s.get("networkEnqueues").is_some());
            assert_eq!(s.to_json()["statistics"]["blockedTime"]["count"], 0);
        }
        assert!(tree.is_empty());
    }
}
