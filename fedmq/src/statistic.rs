//! Hierarchical statistics
//!
//! Every [`Statistic`] is a node in a [`StatisticTree`] arena, addressed by a stable
//! [`StatId`]. A node may name a parent node; each update applied to a child is applied with
//! the identical delta to its parent, and so on up the chain, so a broker-level statistic is
//! always the sum of what its destinations reported while attached to it.
//!
//! Locking: each node has its own mutex. An update holds the child's lock while it updates the
//! parent, always child before parent. Nothing locks a parent and then one of its children, and
//! re-parenting is serialized tree-wide and refuses to create cycles, so the order is total.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BrokerError;
use crate::types::{timestamp_millis, HashMap, TimestampMillis};

pub type StatId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatisticKind {
    /// Monotonic or gauge counter.
    Count,
    /// Gauge whose value is sampled from its owner.
    PollCount,
    /// Cumulative time, with count/min/max/total in milliseconds.
    Time,
    /// Size distribution, with count/min/max/total/average in bytes.
    Size,
}

/// Outcome of a mutator. Disabled statistics silently ignore updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    Applied,
    StatisticsDisabled,
}

impl Update {
    #[inline]
    pub fn is_applied(self) -> bool {
        matches!(self, Update::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta {
    Count(i64),
    Sample(i64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub count: i64,
    pub total: i64,
    pub min: i64,
    pub max: i64,
}

impl Sample {
    #[inline]
    fn apply(&mut self, delta: Delta) {
        match delta {
            Delta::Count(n) => self.count += n,
            Delta::Sample(v) => {
                self.count += 1;
                self.total += v;
                if self.count == 1 || v < self.min {
                    self.min = v;
                }
                if self.count == 1 || v > self.max {
                    self.max = v;
                }
            }
        }
    }

    #[inline]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

struct NodeState {
    sample: Sample,
    enabled: bool,
    do_reset: bool,
    parent: Option<StatId>,
    start_time: TimestampMillis,
    last_sample_time: TimestampMillis,
}

struct Node {
    name: String,
    description: String,
    kind: StatisticKind,
    state: Mutex<NodeState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticSnapshot {
    pub id: StatId,
    pub name: String,
    pub description: String,
    pub kind: StatisticKind,
    pub count: i64,
    pub total: i64,
    pub min: i64,
    pub max: i64,
    pub average: f64,
    pub enabled: bool,
    pub do_reset: bool,
    pub parent: Option<StatId>,
    pub start_time: TimestampMillis,
    pub last_sample_time: TimestampMillis,
}

impl StatisticSnapshot {
    /// The headline number: the counter for counts, the total for time and size.
    #[inline]
    pub fn value(&self) -> i64 {
        match self.kind {
            StatisticKind::Count | StatisticKind::PollCount => self.count,
            StatisticKind::Time | StatisticKind::Size => self.total,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self.kind {
            StatisticKind::Count | StatisticKind::PollCount => json!({
                "count": self.count,
                "enabled": self.enabled,
            }),
            StatisticKind::Time | StatisticKind::Size => json!({
                "count": self.count,
                "total": self.total,
                "min": self.min,
                "max": self.max,
                "average": self.average,
                "enabled": self.enabled,
            }),
        }
    }
}

#[derive(Default)]
struct TreeInner {
    next_id: AtomicU64,
    nodes: RwLock<HashMap<StatId, Arc<Node>>>,
    //serializes parent rebinding so concurrent rebinds cannot build a cycle
    rebind: Mutex<()>,
}

/// Arena owning every statistic of a broker.
#[derive(Clone, Default)]
pub struct StatisticTree {
    inner: Arc<TreeInner>,
}

impl fmt::Debug for StatisticTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatisticTree {{ nodes: {} }}", self.len())
    }
}

impl StatisticTree {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, description: &str, kind: StatisticKind) -> Statistic {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = timestamp_millis();
        let node = Node {
            name: name.into(),
            description: description.into(),
            kind,
            state: Mutex::new(NodeState {
                sample: Sample::default(),
                enabled: true,
                do_reset: true,
                parent: None,
                start_time: now,
                last_sample_time: now,
            }),
        };
        self.inner.nodes.write().insert(id, Arc::new(node));
        Statistic { tree: self.clone(), id }
    }

    /// Drops a node. Children still naming it as parent stop propagating at that point.
    #[inline]
    pub fn remove(&self, id: StatId) {
        self.inner.nodes.write().remove(&id);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.nodes.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn contains(&self, id: StatId) -> bool {
        self.inner.nodes.read().contains_key(&id)
    }

    #[inline]
    pub fn same_tree(&self, other: &StatisticTree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    fn node(&self, id: StatId) -> Option<Arc<Node>> {
        self.inner.nodes.read().get(&id).cloned()
    }

    fn update<F>(&self, id: StatId, f: F) -> Update
    where
        F: FnOnce(&Node, &mut Sample) -> Option<Delta>,
    {
        let node = match self.node(id) {
            Some(node) => node,
            None => return Update::StatisticsDisabled,
        };
        let mut state = node.state.lock();
        if !state.enabled {
            return Update::StatisticsDisabled;
        }
        let delta = match f(&node, &mut state.sample) {
            Some(delta) => delta,
            None => return Update::Applied,
        };
        state.last_sample_time = timestamp_millis();
        if let Some(parent) = state.parent {
            //child lock still held, parent update is atomic with it
            self.propagate(parent, delta);
        }
        Update::Applied
    }

    fn propagate(&self, id: StatId, delta: Delta) {
        let node = match self.node(id) {
            Some(node) => node,
            None => return,
        };
        let mut state = node.state.lock();
        if !state.enabled {
            return;
        }
        state.sample.apply(delta);
        state.last_sample_time = timestamp_millis();
        if let Some(parent) = state.parent {
            self.propagate(parent, delta);
        }
    }

    #[inline]
    fn apply(&self, id: StatId, delta: Delta) -> Update {
        self.update(id, |_, sample| {
            sample.apply(delta);
            Some(delta)
        })
    }

    fn set_value(&self, id: StatId, value: i64) -> Update {
        self.update(id, |node, sample| match node.kind {
            StatisticKind::Count | StatisticKind::PollCount => {
                let delta = value - sample.count;
                if delta == 0 {
                    None
                } else {
                    sample.count = value;
                    Some(Delta::Count(delta))
                }
            }
            StatisticKind::Time | StatisticKind::Size => {
                let delta = Delta::Sample(value);
                sample.apply(delta);
                Some(delta)
            }
        })
    }

    fn reset(&self, id: StatId) {
        if let Some(node) = self.node(id) {
            let mut state = node.state.lock();
            if state.do_reset {
                state.sample = Sample::default();
                let now = timestamp_millis();
                state.start_time = now;
                state.last_sample_time = now;
            }
        }
    }

    fn with_state<T, F>(&self, id: StatId, f: F) -> Option<T>
    where
        F: FnOnce(&Node, &mut NodeState) -> T,
    {
        let node = self.node(id)?;
        let mut state = node.state.lock();
        Some(f(&node, &mut state))
    }

    /// Rebinds every `(child, parent)` pair in one step.
    ///
    /// Fails without changing anything if a node is unknown, or if any binding would make a
    /// node its own ancestor.
    pub fn rebind(&self, bindings: &[(StatId, Option<StatId>)]) -> Result<(), BrokerError> {
        let _guard = self.inner.rebind.lock();
        for (child, parent) in bindings {
            if !self.contains(*child) {
                return Err(BrokerError::InvalidParent(format!("unknown statistic {child}")));
            }
            if let Some(parent) = parent {
                if !self.contains(*parent) {
                    return Err(BrokerError::InvalidParent(format!("unknown statistic {parent}")));
                }
                if self.is_ancestor_or_self(*child, *parent, bindings) {
                    return Err(BrokerError::InvalidParent(format!(
                        "binding {child} under {parent} would create a cycle"
                    )));
                }
            }
        }
        for (child, parent) in bindings {
            self.with_state(*child, |_, state| state.parent = *parent);
        }
        Ok(())
    }

    //walks up from `start`, with the pending bindings taking precedence over current parents
    fn is_ancestor_or_self(&self, candidate: StatId, start: StatId, pending: &[(StatId, Option<StatId>)]) -> bool {
        let mut cur = Some(start);
        let mut steps = 0usize;
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            steps += 1;
            if steps > self.len() + pending.len() {
                return true;
            }
            cur = match pending.iter().find(|(c, _)| *c == id) {
                Some((_, p)) => *p,
                None => self.with_state(id, |_, state| state.parent).flatten(),
            };
        }
        false
    }

    fn snapshot(&self, id: StatId) -> Option<StatisticSnapshot> {
        self.with_state(id, |node, state| StatisticSnapshot {
            id,
            name: node.name.clone(),
            description: node.description.clone(),
            kind: node.kind,
            count: state.sample.count,
            total: state.sample.total,
            min: state.sample.min,
            max: state.sample.max,
            average: state.sample.average(),
            enabled: state.enabled,
            do_reset: state.do_reset,
            parent: state.parent,
            start_time: state.start_time,
            last_sample_time: state.last_sample_time,
        })
    }
}

/// Handle to one node of a [`StatisticTree`].
#[derive(Clone)]
pub struct Statistic {
    tree: StatisticTree,
    id: StatId,
}

impl fmt::Debug for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.snapshot() {
            Some(s) => write!(f, "Statistic {{ id: {}, name: {}, value: {} }}", s.id, s.name, s.value()),
            None => write!(f, "Statistic {{ id: {}, removed }}", self.id),
        }
    }
}

impl Statistic {
    #[inline]
    pub fn id(&self) -> StatId {
        self.id
    }

    #[inline]
    pub fn tree(&self) -> &StatisticTree {
        &self.tree
    }

    #[inline]
    pub fn increment(&self, delta: i64) -> Update {
        self.tree.apply(self.id, Delta::Count(delta))
    }

    #[inline]
    pub fn decrement(&self, delta: i64) -> Update {
        self.tree.apply(self.id, Delta::Count(-delta))
    }

    /// Sets a counter to `value`, forwarding the difference to the parent.
    /// On time and size statistics this records `value` as one sample.
    #[inline]
    pub fn set_value(&self, value: i64) -> Update {
        self.tree.set_value(self.id, value)
    }

    #[inline]
    pub fn add_time(&self, elapsed: Duration) -> Update {
        self.tree.apply(self.id, Delta::Sample(elapsed.as_millis() as i64))
    }

    #[inline]
    pub fn add_size(&self, bytes: usize) -> Update {
        self.tree.apply(self.id, Delta::Sample(bytes as i64))
    }

    #[inline]
    pub fn reset(&self) {
        self.tree.reset(self.id)
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.snapshot().map(|s| s.value()).unwrap_or_default()
    }

    #[inline]
    pub fn sample(&self) -> Sample {
        self.tree.with_state(self.id, |_, state| state.sample).unwrap_or_default()
    }

    #[inline]
    pub fn snapshot(&self) -> Option<StatisticSnapshot> {
        self.tree.snapshot(self.id)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.tree.with_state(self.id, |_, state| state.enabled).unwrap_or(false)
    }

    #[inline]
    pub fn set_enabled(&self, enabled: bool) {
        self.tree.with_state(self.id, |_, state| state.enabled = enabled);
    }

    #[inline]
    pub fn is_do_reset(&self) -> bool {
        self.tree.with_state(self.id, |_, state| state.do_reset).unwrap_or(false)
    }

    #[inline]
    pub fn set_do_reset(&self, do_reset: bool) {
        self.tree.with_state(self.id, |_, state| state.do_reset = do_reset);
    }

    #[inline]
    pub fn parent(&self) -> Option<StatId> {
        self.tree.with_state(self.id, |_, state| state.parent).flatten()
    }

    pub fn set_parent(&self, parent: Option<&Statistic>) -> Result<(), BrokerError> {
        if let Some(p) = parent {
            if !self.tree.same_tree(&p.tree) {
                return Err(BrokerError::InvalidParent("parent belongs to another statistics tree".into()));
            }
        }
        self.tree.rebind(&[(self.id, parent.map(|p| p.id))])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn count_propagates_to_parent() {
        let tree = StatisticTree::new();
        let broker = tree.create("enqueues", "", StatisticKind::Count);
        let a = tree.create("enqueues", "", StatisticKind::Count);
        let b = tree.create("enqueues", "", StatisticKind::Count);
        a.set_parent(Some(&broker)).unwrap();
        b.set_parent(Some(&broker)).unwrap();

        assert_eq!(a.increment(3), Update::Applied);
        b.increment(2);
        b.decrement(1);
        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 1);
        assert_eq!(broker.value(), 4);

        a.set_value(10);
        assert_eq!(broker.value(), 11);
    }

    #[test]
    fn disabled_is_noop() {
        let tree = StatisticTree::new();
        let parent = tree.create("p", "", StatisticKind::Count);
        let s = tree.create("s", "", StatisticKind::Count);
        s.set_parent(Some(&parent)).unwrap();
        s.set_enabled(false);
        assert_eq!(s.increment(1), Update::StatisticsDisabled);
        assert_eq!(s.set_value(7), Update::StatisticsDisabled);
        assert_eq!(s.value(), 0);
        assert_eq!(parent.value(), 0);
    }

    #[test]
    fn disabled_parent_still_counts_child() {
        let tree = StatisticTree::new();
        let parent = tree.create("p", "", StatisticKind::Count);
        let s = tree.create("s", "", StatisticKind::Count);
        s.set_parent(Some(&parent)).unwrap();
        parent.set_enabled(false);
        assert_eq!(s.increment(1), Update::Applied);
        assert_eq!(s.value(), 1);
        assert_eq!(parent.value(), 0);
    }

    #[test]
    fn time_and_size_samples() {
        let tree = StatisticTree::new();
        let parent = tree.create("processTime", "", StatisticKind::Time);
        let t = tree.create("processTime", "", StatisticKind::Time);
        t.set_parent(Some(&parent)).unwrap();
        t.add_time(Duration::from_millis(30));
        t.add_time(Duration::from_millis(10));
        let s = t.sample();
        assert_eq!((s.count, s.total, s.min, s.max), (2, 40, 10, 30));
        assert_eq!(parent.sample(), s);

        let size = tree.create("messageSize", "", StatisticKind::Size);
        size.add_size(100);
        size.add_size(300);
        let snap = size.snapshot().unwrap();
        assert_eq!(snap.average, 200.0);
        assert_eq!(snap.value(), 400);
    }

    #[test]
    fn reset_honours_do_reset() {
        let tree = StatisticTree::new();
        let gauge = tree.create("consumers", "", StatisticKind::Count);
        gauge.set_do_reset(false);
        gauge.increment(2);
        gauge.reset();
        assert_eq!(gauge.value(), 2);

        let counter = tree.create("enqueues", "", StatisticKind::Count);
        counter.increment(2);
        counter.reset();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn rebind_rejects_cycles_and_foreign_trees() {
        let tree = StatisticTree::new();
        let a = tree.create("a", "", StatisticKind::Count);
        let b = tree.create("b", "", StatisticKind::Count);
        let c = tree.create("c", "", StatisticKind::Count);
        a.set_parent(Some(&b)).unwrap();
        b.set_parent(Some(&c)).unwrap();
        assert!(c.set_parent(Some(&a)).is_err());
        assert!(a.set_parent(Some(&a)).is_err());
        assert_eq!(c.parent(), None);

        let other = StatisticTree::new().create("x", "", StatisticKind::Count);
        assert!(a.set_parent(Some(&other)).is_err());

        a.set_parent(None).unwrap();
        a.increment(1);
        assert_eq!(b.value(), 0);
    }

    #[test]
    fn removed_parent_stops_propagation() {
        let tree = StatisticTree::new();
        let parent = tree.create("p", "", StatisticKind::Count);
        let s = tree.create("s", "", StatisticKind::Count);
        s.set_parent(Some(&parent)).unwrap();
        tree.remove(parent.id());
        assert_eq!(s.increment(1), Update::Applied);
        assert_eq!(s.value(), 1);
        assert_eq!(parent.increment(1), Update::StatisticsDisabled);
    }

    #[test]
    fn concurrent_updates_sum_into_parent() {
        let tree = StatisticTree::new();
        let parent = tree.create("p", "", StatisticKind::Count);
        let children: Vec<_> = (0..4)
            .map(|_| {
                let c = tree.create("c", "", StatisticKind::Count);
                c.set_parent(Some(&parent)).unwrap();
                c
            })
            .collect();
        let children = Arc::new(children);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let children = children.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        children[i].increment(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(parent.value(), 4000);
        assert_eq!(children.iter().map(|c| c.value()).sum::<i64>(), 4000);
    }
}
