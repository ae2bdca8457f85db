//! Producer flow control
//!
//! Before a message is enqueued, [`FlowGovernor::admit`] compares the usage ratio reported by a
//! [`UsageTracker`] for the destination against the configured ceiling. Below the ceiling the
//! send proceeds. At or above it the producer is parked until usage drops, the send times out,
//! or the destination is torn down. Every block is recorded in the destination's statistics
//! (`blockedSends`, `blockedTime`) and the parked producer is counted on the destination's
//! `blocked_producers` quiescence lock for as long as it waits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use fedmq_conf::FlowControl;
use fedmq_utils::{Bytesize, CountdownLock};

use crate::error::BrokerError;
use crate::stats::DestinationStatistics;
use crate::types::{DashMap, DestinationName};

/// Source of the resource usage the governor throttles on.
pub trait UsageTracker: Send + Sync + 'static {
    /// Fraction of the budget in use for `destination`, `0.0..=1.0` in the usual case.
    fn current_usage_ratio(&self, destination: &str) -> f64;

    /// Fires whenever usage may have changed.
    fn changed(&self) -> watch::Receiver<()>;

    fn add(&self, _destination: &str, _bytes: usize) {}

    fn remove(&self, _destination: &str, _bytes: usize) {}
}

/// Memory budget shared by all destinations of a broker.
///
/// The ratio is the number of bytes currently held divided by the limit, unless an override
/// has been set for the whole broker or for a single destination.
pub struct MemoryUsage {
    limit: usize,
    used: AtomicUsize,
    global_ratio: RwLock<Option<f64>>,
    ratios: DashMap<DestinationName, f64>,
    changed_tx: watch::Sender<()>,
}

impl MemoryUsage {
    pub fn new(limit: Bytesize) -> Self {
        let (changed_tx, _) = watch::channel(());
        Self {
            limit: limit.as_usize(),
            used: AtomicUsize::new(0),
            global_ratio: RwLock::new(None),
            ratios: DashMap::default(),
            changed_tx,
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn set_usage_ratio(&self, ratio: Option<f64>) {
        *self.global_ratio.write() = ratio;
        self.changed_tx.send_replace(());
    }

    pub fn set_destination_usage_ratio(&self, destination: &str, ratio: Option<f64>) {
        match ratio {
            Some(ratio) => {
                self.ratios.insert(DestinationName::from(destination), ratio);
            }
            None => {
                self.ratios.remove(destination);
            }
        }
        self.changed_tx.send_replace(());
    }
}

impl UsageTracker for MemoryUsage {
    fn current_usage_ratio(&self, destination: &str) -> f64 {
        if let Some(ratio) = self.ratios.get(destination) {
            return *ratio;
        }
        if let Some(ratio) = *self.global_ratio.read() {
            return ratio;
        }
        if self.limit == 0 {
            0.0
        } else {
            self.used() as f64 / self.limit as f64
        }
    }

    #[inline]
    fn changed(&self) -> watch::Receiver<()> {
        self.changed_tx.subscribe()
    }

    #[inline]
    fn add(&self, _destination: &str, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
        self.changed_tx.send_replace(());
    }

    #[inline]
    fn remove(&self, _destination: &str, bytes: usize) {
        let _ = self.used.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
        self.changed_tx.send_replace(());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Unblocked { blocked_for: Duration },
}

/// The destination-side state the governor reads and records into.
pub struct FlowTarget<'a> {
    pub destination: &'a DestinationName,
    pub stats: &'a DestinationStatistics,
    pub blocked_producers: &'a CountdownLock,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone)]
pub struct FlowGovernor {
    cfg: FlowControl,
    tracker: Arc<dyn UsageTracker>,
}

impl FlowGovernor {
    pub fn new(cfg: FlowControl, tracker: Arc<dyn UsageTracker>) -> Self {
        Self { cfg, tracker }
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<dyn UsageTracker> {
        &self.tracker
    }

    #[inline]
    pub fn usage_ceiling(&self) -> f64 {
        self.cfg.usage_ceiling
    }

    #[inline]
    fn over_ceiling(&self, destination: &str) -> Option<f64> {
        let usage = self.tracker.current_usage_ratio(destination);
        if usage >= self.cfg.usage_ceiling {
            Some(usage)
        } else {
            None
        }
    }

    /// Non-parking variant of [`admit`](Self::admit) for callers that must not wait, such as a
    /// bridge reading forwards inline. Over the ceiling the send is refused at once.
    pub fn admit_now(&self, target: FlowTarget<'_>, size: usize) -> Result<Admission, BrokerError> {
        if !target.stats.is_enabled() {
            return Ok(Admission::Allowed);
        }
        match self.over_ceiling(target.destination) {
            None => Ok(Admission::Allowed),
            Some(usage) => {
                target.stats.blocked_sends.increment(1);
                log::debug!("{} send of {} bytes refused, usage {:.2}", target.destination, size, usage);
                Err(BrokerError::ResourceExhausted {
                    destination: target.destination.clone(),
                    usage,
                    ceiling: self.cfg.usage_ceiling,
                })
            }
        }
    }

    /// Decides whether a send of `size` bytes to `target` may proceed, parking the caller while
    /// the destination is over its usage ceiling.
    pub async fn admit(&self, target: FlowTarget<'_>, size: usize) -> Result<Admission, BrokerError> {
        if !target.stats.is_enabled() {
            return Ok(Admission::Allowed);
        }

        //subscribe before checking so a change right after the check still wakes us
        let mut changed = self.tracker.changed();
        let usage = match self.over_ceiling(target.destination) {
            None => return Ok(Admission::Allowed),
            Some(usage) => usage,
        };

        target.stats.blocked_sends.increment(1);
        let exhausted = |usage: f64| BrokerError::ResourceExhausted {
            destination: target.destination.clone(),
            usage,
            ceiling: self.cfg.usage_ceiling,
        };
        if self.cfg.send_fail_if_no_space {
            log::debug!("{} send of {} bytes rejected, usage {:.2}", target.destination, size, usage);
            return Err(exhausted(usage));
        }

        log::debug!("{} send of {} bytes blocked, usage {:.2}", target.destination, size, usage);
        target.blocked_producers.increment();
        let _parked = scopeguard::guard((), |_| target.blocked_producers.decrement());
        let start = Instant::now();

        let wait_for_space = async {
            let mut watching = true;
            loop {
                tokio::select! {
                    res = changed.changed(), if watching => {
                        if res.is_err() {
                            watching = false;
                        }
                    }
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                }
                if self.over_ceiling(target.destination).is_none() {
                    break;
                }
            }
        };

        let waited = async {
            match self.cfg.send_timeout {
                Some(timeout) => tokio::time::timeout(timeout, wait_for_space)
                    .await
                    .map_err(|_| exhausted(self.tracker.current_usage_ratio(target.destination))),
                None => {
                    wait_for_space.await;
                    Ok(())
                }
            }
        };

        let res = tokio::select! {
            _ = target.cancel.cancelled() => {
                Err(BrokerError::Cancelled(format!("send to {} while blocked by flow control", target.destination)))
            }
            res = waited => res,
        };

        let blocked_for = start.elapsed();
        target.stats.blocked_time.add_time(blocked_for);
        log::debug!("{} send unblocked after {:?}, {:?}", target.destination, blocked_for, res);
        res.map(|_| Admission::Unblocked { blocked_for })
    }
}
