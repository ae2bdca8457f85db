use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use fedmq_conf::{NetworkConnector, Settings};

use crate::bridge::registry::BridgeRegistry;
use crate::bridge::transport::{Advertisement, BridgeTransport, RemoteConsumer};
use crate::bridge::NetworkBridge;
use crate::destination::Destination;
use crate::error::BrokerError;
use crate::event::{DestinationEvent, EventBus};
use crate::governor::{Admission, FlowGovernor, MemoryUsage, UsageTracker};
use crate::statistic::StatisticTree;
use crate::stats::DestinationStatistics;
use crate::store::{MemoryMessageStore, MessageStore};
use crate::types::{
    timestamp_millis, BrokerId, ConsumerId, ConsumerInfo, DashMap, DeliveryRx, DestinationInfo, DestinationName,
    Message, TimestampMillis,
};
use crate::Result;

/// Everything one broker instance owns: its destinations, the statistics tree they report into,
/// flow control, the message store and its network bridges.
#[derive(Clone)]
pub struct BrokerContext {
    inner: Arc<BrokerContextInner>,
}

pub struct BrokerContextInner {
    pub settings: Settings,
    pub tree: StatisticTree,
    //broker-wide rollup every destination bundle is parented to
    pub stats: DestinationStatistics,
    pub governor: FlowGovernor,
    pub store: Arc<dyn MessageStore>,
    pub registry: BridgeRegistry,
    pub events: Arc<EventBus>,
    destinations: DashMap<DestinationName, Destination>,
    creating: Mutex<()>,
    pub(crate) bridges: DashMap<BrokerId, NetworkBridge>,
    consumer_seq: AtomicU64,
    started_at: TimestampMillis,
}

impl Deref for BrokerContext {
    type Target = BrokerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BrokerContext {}@{}", self.name(), self.id())
    }
}

pub struct BrokerContextBuilder {
    settings: Settings,
    store: Option<Arc<dyn MessageStore>>,
    usage: Option<Arc<dyn UsageTracker>>,
}

impl BrokerContextBuilder {
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn usage_tracker(mut self, usage: Arc<dyn UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> BrokerContext {
        let settings = self.settings;
        let usage = self
            .usage
            .unwrap_or_else(|| Arc::new(MemoryUsage::new(settings.flow_control.memory_limit)) as Arc<dyn UsageTracker>);
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>);
        let tree = StatisticTree::new();
        let stats = DestinationStatistics::new(&tree);
        stats.set_enabled(settings.statistics.enabled);
        stats.set_do_reset(settings.statistics.reset_enabled);
        BrokerContext {
            inner: Arc::new(BrokerContextInner {
                governor: FlowGovernor::new(settings.flow_control.clone(), usage),
                registry: BridgeRegistry::new(settings.broker.id),
                settings,
                tree,
                stats,
                store,
                events: Arc::new(EventBus::new()),
                destinations: DashMap::default(),
                creating: Mutex::new(()),
                bridges: DashMap::default(),
                consumer_seq: AtomicU64::new(0),
                started_at: timestamp_millis(),
            }),
        }
    }
}

impl BrokerContext {
    #[inline]
    pub fn new(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    #[inline]
    pub fn builder(settings: Settings) -> BrokerContextBuilder {
        BrokerContextBuilder { settings, store: None, usage: None }
    }

    #[inline]
    pub fn id(&self) -> BrokerId {
        self.settings.broker.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.settings.broker.name
    }

    #[inline]
    pub fn destination(&self, name: &str) -> Option<Destination> {
        self.destinations.get(name).map(|d| d.value().clone())
    }

    #[inline]
    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.iter().map(|d| d.value().clone()).collect()
    }

    /// Returns the destination named by `info`, creating it (and recovering its stored
    /// messages) if it does not exist yet.
    pub async fn get_or_create_destination(&self, info: DestinationInfo) -> Result<Destination> {
        if let Some(d) = self.destination(&info.name) {
            return Ok(d);
        }
        let _creating = self.creating.lock().await;
        if let Some(d) = self.destination(&info.name) {
            return Ok(d);
        }

        let stats = DestinationStatistics::new(&self.tree);
        stats.set_parent(Some(&self.stats))?;
        stats.set_enabled(self.settings.statistics.enabled);
        stats.set_do_reset(self.settings.statistics.reset_enabled);
        let destination =
            Destination::new(info.clone(), stats, self.store.clone(), self.governor.clone(), self.events.clone());
        destination.recover().await?;
        self.destinations.insert(info.name.clone(), destination.clone());
        log::info!("{} {} created on broker {}", info.kind, info.name, self.id());
        self.events.publish(DestinationEvent::DestinationAdded(info));
        Ok(destination)
    }

    #[inline]
    pub async fn queue(&self, name: &str) -> Result<Destination> {
        self.get_or_create_destination(DestinationInfo::queue(name)).await
    }

    #[inline]
    pub async fn topic(&self, name: &str) -> Result<Destination> {
        self.get_or_create_destination(DestinationInfo::topic(name)).await
    }

    /// Closes and forgets a destination. Parked producers are released with `Cancelled`.
    pub fn remove_destination(&self, name: &str) -> Result<Destination> {
        let (_, destination) =
            self.destinations.remove(name).ok_or_else(|| BrokerError::DestinationNotFound(name.into()))?;
        destination.close();
        self.events.publish(DestinationEvent::DestinationRemoved(destination.info.clone()));
        Ok(destination)
    }

    #[inline]
    fn existing(&self, name: &str) -> Result<Destination> {
        Ok(self.destination(name).ok_or_else(|| BrokerError::DestinationNotFound(name.into()))?)
    }

    pub async fn send(&self, destination: &str, message: Message) -> Result<Admission> {
        self.existing(destination)?.send(message).await
    }

    /// Attaches a local consumer with a broker-generated id.
    pub async fn subscribe(&self, destination: &str, prefetch: usize) -> Result<(ConsumerId, DeliveryRx)> {
        let seq = self.consumer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = ConsumerId::from(format!("{}:{}", self.name(), seq));
        let rx = self.subscribe_with(ConsumerInfo::new(id.clone(), destination).prefetch(prefetch)).await?;
        Ok((id, rx))
    }

    pub async fn subscribe_with(&self, info: ConsumerInfo) -> Result<DeliveryRx> {
        self.existing(&info.destination)?.add_consumer(info).await
    }

    pub async fn unsubscribe(&self, destination: &str, consumer: &str) -> Result<usize> {
        self.existing(destination)?.remove_consumer(consumer).await
    }

    pub async fn ack(&self, destination: &str, consumer: &str, message_id: &str) -> Result<()> {
        self.existing(destination)?.ack(consumer, message_id).await
    }

    /// What this broker tells a new peer about itself: every destination and every local
    /// consumer. Consumers that belong to other bridges are never advertised.
    pub fn advertisement(&self) -> Advertisement {
        let mut advert = Advertisement::default();
        for d in self.destinations() {
            advert.consumers.extend(d.consumers().into_iter().filter(|c| !c.is_network()).map(|c| {
                RemoteConsumer { destination: d.info.clone(), consumer: c.id, priority: c.priority }
            }));
            advert.destinations.push(d.info.clone());
        }
        advert
    }

    #[inline]
    pub fn connector(&self, name: &str) -> Option<NetworkConnector> {
        self.settings.network.connectors.iter().find(|c| c.name == name).cloned()
    }

    /// Starts a bridge over `transport`. A second bridge to the same remote broker, or a bridge
    /// back to this broker, is refused before any frame is exchanged.
    pub fn connect(&self, cfg: NetworkConnector, transport: Arc<dyn BridgeTransport>) -> Result<NetworkBridge> {
        let remote = transport.remote_identity();
        self.registry.try_register(remote, &cfg.name, cfg.network_ttl)?;
        log::info!("broker {} connecting bridge {} to broker {}", self.id(), cfg.name, remote);
        Ok(NetworkBridge::start(self.clone(), cfg, transport))
    }

    /// Like [`connect`](Self::connect), using the named connector from the settings.
    pub fn connect_with(&self, connector: &str, transport: Arc<dyn BridgeTransport>) -> Result<NetworkBridge> {
        let cfg = self.connector(connector).ok_or_else(|| anyhow::anyhow!("unknown network connector {}", connector))?;
        self.connect(cfg, transport)
    }

    #[inline]
    pub fn bridge(&self, remote: BrokerId) -> Option<NetworkBridge> {
        self.bridges.get(&remote).map(|b| b.value().clone())
    }

    #[inline]
    pub fn bridges(&self) -> Vec<NetworkBridge> {
        self.bridges.iter().map(|b| b.value().clone()).collect()
    }

    pub(crate) fn detach_bridge(&self, bridge: &NetworkBridge) {
        self.bridges.remove_if(&bridge.remote, |_, b| b.ptr_eq(bridge));
    }

    pub fn set_statistics_enabled(&self, enabled: bool) {
        log::info!("broker {} statistics {}", self.id(), if enabled { "enabled" } else { "disabled" });
        self.stats.set_enabled(enabled);
        for d in self.destinations() {
            d.stats.set_enabled(enabled);
        }
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
        for d in self.destinations() {
            d.stats.reset();
        }
    }

    pub fn pause(&self, destination: &str) -> Result<()> {
        self.existing(destination)?.pause();
        Ok(())
    }

    pub async fn resume(&self, destination: &str) -> Result<()> {
        self.existing(destination)?.resume().await;
        Ok(())
    }

    /// Sweeps expired messages from every destination.
    pub async fn expire_messages(&self) -> usize {
        let mut expired = 0;
        for d in self.destinations() {
            expired += d.expire_messages().await;
        }
        expired
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        let mut destinations = self.destinations();
        destinations.sort_by(|a, b| a.name().cmp(b.name()));
        let mut bridges = self.bridges();
        bridges.sort_by_key(|b| b.remote);
        json!({
            "broker": {
                "id": self.id(),
                "name": self.name(),
                "started_at": fedmq_utils::format_timestamp_millis(self.started_at),
            },
            "totals": self.stats.to_json(),
            "destinations": destinations.iter().map(|d| d.to_json()).collect::<Vec<_>>(),
            "bridges": bridges.iter().map(|b| b.to_json()).collect::<Vec<_>>(),
            "registry": self.registry.to_json(),
        })
    }

    /// Stops every bridge, then closes every destination.
    pub async fn stop(&self) {
        for bridge in self.bridges() {
            bridge.stop().await;
        }
        for d in self.destinations() {
            d.close();
        }
        log::info!("broker {} stopped", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::pair;

    fn context(id: BrokerId) -> BrokerContext {
        BrokerContext::new(Settings::from_toml(&format!("[broker]\nid = {id}\nname = \"b{id}\"")).unwrap())
    }

    #[tokio::test]
    async fn destinations_roll_up_into_broker_totals() {
        let ctx = context(1);
        let orders = ctx.queue("orders").await.unwrap();
        let again = ctx.queue("orders").await.unwrap();
        assert_eq!(orders.name(), again.name());
        ctx.queue("invoices").await.unwrap();

        ctx.send("orders", Message::new("orders", "a")).await.unwrap();
        ctx.send("invoices", Message::new("invoices", "b")).await.unwrap();
        ctx.send("invoices", Message::new("invoices", "c")).await.unwrap();
        assert_eq!(ctx.stats.enqueues.value(), 3);
        assert_eq!(ctx.stats.messages.value(), 3);

        ctx.reset_statistics();
        assert_eq!(ctx.stats.enqueues.value(), 0);
        assert_eq!(orders.stats.enqueues.value(), 0);
        //gauges survive the reset
        assert_eq!(orders.stats.messages.value(), 1);

        ctx.set_statistics_enabled(false);
        ctx.send("orders", Message::new("orders", "d")).await.unwrap();
        assert_eq!(orders.stats.enqueues.value(), 0);

        let err = ctx.send("missing", Message::new("missing", "x")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::DestinationNotFound(_))));
        let json = ctx.statistics_json();
        assert_eq!(json["destinations"].as_array().map(|d| d.len()), Some(2));
    }

    #[tokio::test]
    async fn subscribe_ack_and_remove() {
        let ctx = context(1);
        let mut events = ctx.events.subscribe();
        ctx.queue("orders").await.unwrap();
        let (id, mut rx) = ctx.subscribe("orders", 10).await.unwrap();
        assert_eq!(id.to_string(), "b1:1");
        ctx.send("orders", Message::new("orders", "a")).await.unwrap();
        let d = rx.recv().await.unwrap();
        ctx.ack("orders", &id, &d.message.id).await.unwrap();
        assert_eq!(ctx.destination("orders").unwrap().stats.dequeues.value(), 1);

        let advert = ctx.advertisement();
        assert_eq!(advert.destinations.len(), 1);
        assert_eq!(advert.consumers.len(), 1);

        let removed = ctx.remove_destination("orders").unwrap();
        assert!(removed.is_closed());
        assert!(ctx.destination("orders").is_none());
        let mut seen = Vec::new();
        while let Ok(e) = events.try_recv() {
            seen.push(e);
        }
        assert!(matches!(seen.first(), Some(DestinationEvent::DestinationAdded(_))));
        assert!(matches!(seen.last(), Some(DestinationEvent::DestinationRemoved(_))));
    }

    #[tokio::test]
    async fn connect_refuses_self_and_duplicates() {
        let ctx = context(1);
        let (to_self, _peer) = pair(1, 1);
        let err = ctx.connect(NetworkConnector::default(), Arc::new(to_self)).unwrap_err();
        assert!(matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::LoopDetected { .. })));
        assert!(ctx.bridges().is_empty());
        assert!(ctx.connect_with("missing", Arc::new(pair(1, 2).0)).is_err());
    }
}
