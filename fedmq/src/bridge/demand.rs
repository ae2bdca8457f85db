//! Remote demand bookkeeping
//!
//! A [`DemandTable`] remembers what the peer advertised (destinations and the consumers attached
//! to them) and derives the set of upstream subscriptions this side should hold:
//!
//! - `dynamic_only`: only destinations with at least one consumer on the peer.
//! - otherwise: every advertised, non-temporary destination.
//! - `conduit_subscriptions`: one subscription per destination, however many consumers.
//! - otherwise: one subscription per remote consumer, or one per destination while it has none.
//!
//! Temporary and excluded destinations never produce demand.

use std::collections::BTreeMap;

use fedmq_conf::NetworkConnector;

use crate::types::{
    BrokerId, ConsumerId, DestinationInfo, DestinationName, HashMap, Priority, SubscriptionId, DEFAULT_PRIORITY,
    NETWORK_CONSUMER_PRIORITY,
};

use super::transport::{Advertisement, RemoteConsumer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demand {
    pub subscription: SubscriptionId,
    pub destination: DestinationInfo,
    pub priority: Priority,
}

pub struct DemandTable {
    remote: BrokerId,
    cfg: NetworkConnector,
    destinations: HashMap<DestinationName, DestinationInfo>,
    consumers: HashMap<DestinationName, BTreeMap<ConsumerId, Priority>>,
}

impl DemandTable {
    pub fn new(remote: BrokerId, cfg: NetworkConnector) -> Self {
        Self { remote, cfg, destinations: HashMap::default(), consumers: HashMap::default() }
    }

    pub fn advertise(&mut self, advert: Advertisement) {
        for d in advert.destinations {
            self.destinations.insert(d.name.clone(), d);
        }
        for c in advert.consumers {
            self.consumer_added(c);
        }
    }

    pub fn destination_removed(&mut self, destination: &DestinationInfo) {
        self.destinations.remove(&destination.name);
        self.consumers.remove(&destination.name);
    }

    pub fn consumer_added(&mut self, c: RemoteConsumer) -> bool {
        self.destinations.entry(c.destination.name.clone()).or_insert_with(|| c.destination.clone());
        self.consumers.entry(c.destination.name).or_default().insert(c.consumer, c.priority).is_none()
    }

    pub fn consumer_removed(&mut self, c: &RemoteConsumer) -> bool {
        match self.consumers.get_mut(&c.destination.name) {
            Some(set) => {
                let removed = set.remove(&c.consumer).is_some();
                if set.is_empty() {
                    self.consumers.remove(&c.destination.name);
                }
                removed
            }
            None => false,
        }
    }

    #[inline]
    pub fn remote_consumers(&self, destination: &str) -> usize {
        self.consumers.get(destination).map(|s| s.len()).unwrap_or_default()
    }

    #[inline]
    fn eligible(&self, d: &DestinationInfo) -> bool {
        !d.temporary && !self.cfg.is_excluded(&d.name)
    }

    //remote consumers keep their own priority unless network consumers are demoted
    #[inline]
    fn priority(&self, remote: Option<Priority>) -> Priority {
        if self.cfg.decrease_network_consumer_priority {
            NETWORK_CONSUMER_PRIORITY
        } else {
            remote.unwrap_or(DEFAULT_PRIORITY)
        }
    }

    #[inline]
    fn destination_subscription(&self, d: &DestinationInfo) -> SubscriptionId {
        SubscriptionId::from(format!("{}:{}:{}", self.remote, d.kind, d.name))
    }

    #[inline]
    fn consumer_subscription(&self, d: &DestinationInfo, consumer: &ConsumerId) -> SubscriptionId {
        SubscriptionId::from(format!("{}:{}:{}:{}", self.remote, d.kind, d.name, consumer))
    }

    /// The subscriptions this side should currently hold, keyed by subscription id.
    pub fn desired(&self) -> BTreeMap<SubscriptionId, Demand> {
        let mut desired = BTreeMap::new();
        for d in self.destinations.values().filter(|d| self.eligible(d)) {
            let consumers = self.consumers.get(&d.name);
            let has_consumers = consumers.map(|c| !c.is_empty()).unwrap_or(false);
            if self.cfg.dynamic_only && !has_consumers {
                continue;
            }
            match consumers {
                Some(consumers) if has_consumers && !self.cfg.conduit_subscriptions => {
                    for (c, p) in consumers {
                        let subscription = self.consumer_subscription(d, c);
                        let priority = self.priority(Some(*p));
                        desired.insert(
                            subscription.clone(),
                            Demand { subscription, destination: d.clone(), priority },
                        );
                    }
                }
                _ => {
                    let subscription = self.destination_subscription(d);
                    let priority = self.priority(consumers.and_then(|c| c.values().max().copied()));
                    desired.insert(subscription.clone(), Demand { subscription, destination: d.clone(), priority });
                }
            }
        }
        desired
    }
}
