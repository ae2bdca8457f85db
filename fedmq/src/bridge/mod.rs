//! Network bridges between brokers
//!
//! A [`NetworkBridge`] is one side of a session with another broker over an established
//! [`BridgeTransport`]. Both sides run the same driver:
//!
//! - they exchange [`BrokerInfo`](transport::BrokerInfo) and reject loops,
//! - each advertises its destinations and local consumers, then keeps the peer informed,
//! - from what the peer advertised, each side derives its [`demand`] and attaches one network
//!   consumer per upstream subscription to the matching local destination,
//! - messages dispatched to such a consumer are forwarded to the peer within a per-subscription
//!   [`credit`] window and acknowledged back once the peer has enqueued them. A forward the
//!   peer refuses is nacked, returned to the local destination and retried after a pause.
//!
//! The lifecycle itself is the pure [`state::transition`] function; the driver only executes
//! the effects it returns.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fedmq_conf::NetworkConnector;
use fedmq_utils::CountdownLock;

use crate::context::BrokerContext;
use crate::destination::Destination;
use crate::error::BrokerError;
use crate::event::DestinationEvent;
use crate::types::{
    timestamp_millis, BrokerId, ConsumerId, ConsumerInfo, DashMap, DeliveryRx, DestinationInfo, DestinationKind,
    HashSet, Message, NetworkOrigin, SubscriptionId, TimestampMillis,
};
use crate::Result;

use self::credit::CreditWindow;
use self::demand::{Demand, DemandTable};
use self::state::{transition, BridgeEvent, BridgeState, Effect, Peers};
use self::transport::{Advertisement, BridgeFrame, BridgeTransport, BrokerInfo, RemoteConsumer};

pub mod credit;
pub mod demand;
pub mod registry;
pub mod state;
pub mod transport;

/// A forward received from the peer, waiting to be enqueued locally.
struct Inbound {
    subscription: SubscriptionId,
    kind: DestinationKind,
    message: Message,
}

/// One upstream subscription: a network consumer on a local destination plus its credit.
struct Subscription {
    //unique per incarnation, also the subscription id on the wire
    consumer: ConsumerId,
    demand: Demand,
    destination: Destination,
    credit: CreditWindow,
    cancel: CancellationToken,
    //set when the peer refuses a forward, nothing is forwarded before then
    resume_at: Mutex<Option<Instant>>,
}

impl Subscription {
    #[inline]
    fn is_closing(&self) -> bool {
        self.credit.is_closed()
    }
}

#[derive(Clone)]
pub struct NetworkBridge {
    inner: Arc<BridgeInner>,
}

pub struct BridgeInner {
    pub local: BrokerId,
    pub remote: BrokerId,
    pub cfg: NetworkConnector,
    ctx: BrokerContext,
    transport: Arc<dyn BridgeTransport>,
    state_tx: watch::Sender<BridgeState>,
    mailbox: mpsc::UnboundedSender<BridgeEvent>,
    //forwards sent and not yet acknowledged, across all subscriptions
    inflight: CountdownLock,
    forwarding: CancellationToken,
    //cancels inbound forwards still waiting on local flow control once the bridge is gone
    inbound_cancel: CancellationToken,
    subscriptions: DashMap<ConsumerId, Arc<Subscription>>,
    subscription_seq: AtomicU64,
    last_error: Mutex<Option<BrokerError>>,
    created_at: TimestampMillis,
}

impl Deref for NetworkBridge {
    type Target = BridgeInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for NetworkBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkBridge {{ {} {} -> {}, {:?} }}", self.cfg.name, self.local, self.remote, self.state())
    }
}

impl NetworkBridge {
    /// Starts the driver of a bridge whose registry slot has already been claimed.
    pub(crate) fn start(ctx: BrokerContext, cfg: NetworkConnector, transport: Arc<dyn BridgeTransport>) -> Self {
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(BridgeState::Connecting);
        //subscribed before anything is advertised, so no local change can be missed
        let local_events = ctx.events.subscribe();
        let bridge = NetworkBridge {
            inner: Arc::new(BridgeInner {
                local: ctx.id(),
                remote: transport.remote_identity(),
                cfg,
                ctx,
                transport,
                state_tx,
                mailbox,
                inflight: CountdownLock::new(),
                forwarding: CancellationToken::new(),
                inbound_cancel: CancellationToken::new(),
                subscriptions: DashMap::default(),
                subscription_seq: AtomicU64::new(0),
                last_error: Mutex::new(None),
                created_at: timestamp_millis(),
            }),
        };
        bridge.ctx.bridges.insert(bridge.remote, bridge.clone());
        tokio::spawn(bridge.clone().run(mailbox_rx, local_events));
        bridge
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    #[inline]
    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Forwards currently awaiting acknowledgement from the peer.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight.count()
    }

    /// Number of upstream subscriptions, including those still closing.
    #[inline]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn last_error(&self) -> Option<BrokerError> {
        self.last_error.lock().clone()
    }

    #[inline]
    pub(crate) fn ptr_eq(&self, other: &NetworkBridge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the bridge has reached `state` or any later one.
    pub async fn reached(&self, state: BridgeState) {
        let rank = |s: &BridgeState| match s {
            BridgeState::Connecting => 0,
            BridgeState::Handshaking => 1,
            BridgeState::Active => 2,
            BridgeState::Draining => 3,
            BridgeState::Closed => 4,
        };
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| rank(s) >= rank(&state)).await;
    }

    #[inline]
    pub async fn closed(&self) {
        self.reached(BridgeState::Closed).await
    }

    /// Gracefully stops the bridge: forwarding stops, the peer is told, and the bridge closes
    /// once outstanding forwards are acknowledged or the drain timeout elapses.
    pub async fn stop(&self) {
        if self.mailbox.send(BridgeEvent::Stop).is_ok() {
            self.closed().await;
        }
    }

    async fn run(
        self,
        mut mailbox: mpsc::UnboundedReceiver<BridgeEvent>,
        mut local_events: mpsc::UnboundedReceiver<DestinationEvent>,
    ) {
        let mut demand = DemandTable::new(self.remote, self.cfg.clone());
        let inbound = self.cfg.dispatch_async.then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(self.clone().inbound_worker(rx));
            tx
        });
        let mut connected = true;

        self.apply(BridgeEvent::Registered).await;
        while !self.state().is_closed() {
            let event = tokio::select! {
                frame = self.transport.recv(), if connected => match frame {
                    Some(frame) => self.on_frame(frame, &mut demand, inbound.as_ref()).await,
                    None => {
                        connected = false;
                        Some(BridgeEvent::TransportFailed("connection lost".into()))
                    }
                },
                Some(event) = local_events.recv() => {
                    self.on_local_event(event).await;
                    None
                },
                Some(event) = mailbox.recv() => Some(event),
                else => break,
            };
            if let Some(event) = event {
                self.apply(event).await;
            }
        }
        log::info!("bridge {} to broker {} exited", self.cfg.name, self.remote);
    }

    async fn apply(&self, event: BridgeEvent) {
        let current = self.state();
        let (next, effects) = transition(Peers { local: self.local, remote: self.remote }, current, event);
        for effect in effects {
            self.execute(effect).await;
        }
        if next != current {
            log::info!("bridge {} to broker {}, {:?} -> {:?}", self.cfg.name, self.remote, current, next);
            self.state_tx.send_replace(next);
        }
    }

    async fn execute(&self, effect: Effect) {
        match effect {
            Effect::SendBrokerInfo => {
                let info = BrokerInfo {
                    id: self.local,
                    name: self.ctx.name().to_owned(),
                    network_path: self.ctx.registry.network_path(self.remote),
                };
                self.send_frame(BridgeFrame::BrokerInfo(info)).await;
            }
            Effect::StartHandshakeTimer => self.schedule(self.cfg.handshake_timeout, BridgeEvent::HandshakeTimeout),
            Effect::Advertise => {
                let advert = self.ctx.advertisement();
                log::info!(
                    "bridge {} advertising {} destinations and {} consumers to broker {}",
                    self.cfg.name,
                    advert.destinations.len(),
                    advert.consumers.len(),
                    self.remote
                );
                self.send_frame(BridgeFrame::Advertise(advert)).await;
            }
            Effect::StopForwarding => self.forwarding.cancel(),
            Effect::SendShutdown => self.send_frame(BridgeFrame::Shutdown).await,
            Effect::WaitForDrain => {
                let bridge = self.clone();
                tokio::spawn(async move {
                    let event = match tokio::time::timeout(bridge.cfg.drain_timeout, bridge.inflight.zeroed()).await {
                        Ok(()) => BridgeEvent::Drained,
                        Err(_) => BridgeEvent::DrainTimeout,
                    };
                    let _ = bridge.mailbox.send(event);
                });
            }
            Effect::AbandonInflight => {
                for sub in self.subscription_list() {
                    let abandoned = sub.credit.abandon();
                    if !abandoned.is_empty() {
                        log::warn!(
                            "bridge {} abandoning {} unacknowledged forwards on {}",
                            self.cfg.name,
                            abandoned.len(),
                            sub.consumer
                        );
                    }
                    for _ in abandoned {
                        self.inflight.decrement();
                    }
                }
            }
            Effect::Unregister => {
                self.inbound_cancel.cancel();
                self.ctx.detach_bridge(self);
                self.ctx.registry.unregister(self.remote);
                for sub in self.subscription_list() {
                    sub.cancel.cancel();
                    sub.credit.close();
                    self.retire(&sub).await;
                }
            }
            Effect::CloseTransport => self.transport.close().await,
            Effect::Fail(e) => {
                log::warn!("bridge {} to broker {} failed, {}", self.cfg.name, self.remote, e);
                *self.last_error.lock() = Some(e);
            }
        }
    }

    fn schedule(&self, after: Duration, event: BridgeEvent) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = mailbox.send(event);
        });
    }

    async fn send_frame(&self, frame: BridgeFrame) {
        let name = frame.name();
        if let Err(e) = self.transport.send(frame).await {
            log::debug!("bridge {} failed to send {} to broker {}, {:?}", self.cfg.name, name, self.remote, e);
        }
    }

    async fn on_frame(
        &self,
        frame: BridgeFrame,
        demand: &mut DemandTable,
        inbound: Option<&mpsc::UnboundedSender<Inbound>>,
    ) -> Option<BridgeEvent> {
        log::trace!("bridge {} received {} from broker {}", self.cfg.name, frame.name(), self.remote);
        let demand_changed = match frame {
            BridgeFrame::BrokerInfo(info) => {
                self.ctx.registry.set_network_path(self.remote, &info.network_path);
                return Some(BridgeEvent::RemoteInfo(info));
            }
            BridgeFrame::Shutdown => return Some(BridgeEvent::RemoteShutdown),
            BridgeFrame::Forward { subscription, kind, message } => {
                let forward = Inbound { subscription, kind, message };
                match inbound {
                    Some(tx) => {
                        if tx.send(forward).is_err() {
                            log::warn!("bridge {} inbound worker is gone", self.cfg.name);
                        }
                    }
                    None => self.receive(forward, true).await,
                }
                return None;
            }
            BridgeFrame::Ack { subscription, message_id } => {
                self.on_ack(&subscription, &message_id).await;
                return None;
            }
            BridgeFrame::Nack { subscription, message_id } => {
                self.on_nack(&subscription, &message_id).await;
                return None;
            }
            _ if !self.is_active() => {
                log::debug!("bridge {} ignoring demand change while {:?}", self.cfg.name, self.state());
                return None;
            }
            BridgeFrame::Advertise(advert) => {
                demand.advertise(advert);
                true
            }
            BridgeFrame::Withdraw(info) => {
                demand.destination_removed(&info);
                true
            }
            BridgeFrame::ConsumerAdded(c) => demand.consumer_added(c),
            BridgeFrame::ConsumerRemoved(c) => demand.consumer_removed(&c),
        };
        if demand_changed {
            self.reconcile(demand).await;
        }
        None
    }

    async fn on_local_event(&self, event: DestinationEvent) {
        //anything before activation is covered by the advertisement
        if !self.is_active() {
            return;
        }
        let frame = match event {
            DestinationEvent::DestinationAdded(info) => {
                BridgeFrame::Advertise(Advertisement { destinations: vec![info], consumers: Vec::new() })
            }
            DestinationEvent::DestinationRemoved(info) => BridgeFrame::Withdraw(info),
            DestinationEvent::ConsumerAdded { destination, consumer } if !consumer.is_network() => {
                BridgeFrame::ConsumerAdded(RemoteConsumer {
                    destination,
                    consumer: consumer.id,
                    priority: consumer.priority,
                })
            }
            DestinationEvent::ConsumerRemoved { destination, consumer } if !consumer.is_network() => {
                BridgeFrame::ConsumerRemoved(RemoteConsumer {
                    destination,
                    consumer: consumer.id,
                    priority: consumer.priority,
                })
            }
            _ => return,
        };
        self.send_frame(frame).await;
    }

    #[inline]
    fn subscription_list(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.iter().map(|s| s.value().clone()).collect()
    }

    /// Brings the upstream subscriptions in line with what the peer currently asks for.
    async fn reconcile(&self, demand: &DemandTable) {
        let desired = demand.desired();
        let (open, stale): (Vec<_>, Vec<_>) = self
            .subscription_list()
            .into_iter()
            .filter(|s| !s.is_closing())
            .partition(|s| desired.get(&s.demand.subscription) == Some(&s.demand));
        for sub in stale {
            self.close_subscription(sub).await;
        }
        let open: HashSet<SubscriptionId> = open.into_iter().map(|s| s.demand.subscription.clone()).collect();
        for (id, d) in desired {
            if open.contains(&id) {
                continue;
            }
            if let Err(e) = self.open_subscription(d).await {
                log::warn!("bridge {} failed to subscribe {}, {:?}", self.cfg.name, id, e);
            }
        }
    }

    /// Attaches a network consumer for `demand`. Demand is already deduplicated per
    /// subscription id, several subscriptions may share one destination.
    async fn open_subscription(&self, demand: Demand) -> Result<()> {
        let destination = self.ctx.get_or_create_destination(demand.destination.clone()).await?;
        let seq = self.subscription_seq.fetch_add(1, Ordering::SeqCst);
        let consumer = ConsumerId::from(format!("{}#{}", demand.subscription, seq));
        let info = ConsumerInfo::new(consumer.clone(), destination.name().clone())
            .prefetch(self.cfg.prefetch_size)
            .priority(demand.priority)
            .network(NetworkOrigin { remote: self.remote, network_ttl: self.cfg.network_ttl });
        let deliveries = destination.add_consumer(info).await?;
        let sub = Arc::new(Subscription {
            consumer: consumer.clone(),
            credit: CreditWindow::new(consumer.clone(), self.cfg.prefetch_size),
            cancel: self.forwarding.child_token(),
            resume_at: Mutex::new(None),
            destination,
            demand,
        });
        self.subscriptions.insert(consumer, sub.clone());
        if self.ctx.registry.mark_destination(self.remote, sub.destination.name()) {
            log::debug!("bridge {} now bridges {} to broker {}", self.cfg.name, sub.destination.name(), self.remote);
        }
        log::info!(
            "bridge {} subscribed {} {} for broker {}, priority {}",
            self.cfg.name,
            sub.destination.kind(),
            sub.destination.name(),
            self.remote,
            sub.demand.priority
        );
        tokio::spawn(self.clone().forward(sub, deliveries));
        Ok(())
    }

    /// Stops forwarding on `sub`; it is retired once every outstanding forward is acknowledged.
    async fn close_subscription(&self, sub: Arc<Subscription>) {
        sub.cancel.cancel();
        let outstanding = sub.credit.close();
        log::info!("bridge {} closing {}, {} forwards outstanding", self.cfg.name, sub.consumer, outstanding);
        if outstanding == 0 {
            self.retire(&sub).await;
        }
    }

    async fn retire(&self, sub: &Subscription) {
        if self.subscriptions.remove(&sub.consumer).is_none() {
            return;
        }
        match sub.destination.remove_consumer(&sub.consumer).await {
            Ok(0) => {}
            Ok(returned) => {
                log::debug!("{} returned {} messages to {}", sub.consumer, returned, sub.destination.name())
            }
            Err(e) => log::warn!("bridge {} failed to remove {}, {:?}", self.cfg.name, sub.consumer, e),
        }
        let name = sub.destination.name();
        if !self.subscriptions.iter().any(|s| s.destination.name() == name) {
            self.ctx.registry.unmark_destination(self.remote, name);
        }
    }

    /// Forwards what is dispatched to the network consumer of `sub`, one credit per message.
    async fn forward(self, sub: Arc<Subscription>, mut deliveries: DeliveryRx) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = sub.cancel.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let resume_at = *sub.resume_at.lock();
            if let Some(at) = resume_at {
                tokio::select! {
                    biased;
                    _ = sub.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            let message_id = delivery.message.id.clone();
            let acquired = tokio::select! {
                biased;
                _ = sub.cancel.cancelled() => break,
                acquired = sub.credit.acquire_wait(message_id.clone()) => acquired,
            };
            if let Err(e) = acquired {
                log::debug!("bridge {} stops forwarding on {}, {}", self.cfg.name, sub.consumer, e);
                break;
            }

            self.inflight.increment();
            sub.destination.stats.forwards.increment(1);
            let frame = BridgeFrame::Forward {
                subscription: sub.consumer.clone(),
                kind: sub.destination.kind(),
                message: delivery.message,
            };
            if let Err(e) = self.transport.send(frame).await {
                log::warn!("bridge {} failed to forward {} to broker {}, {:?}", self.cfg.name, message_id, self.remote, e);
                //abandoned credit was already accounted for
                if sub.credit.release(&message_id).is_some() {
                    sub.destination.stats.forwards.decrement(1);
                    self.inflight.decrement();
                }
                if sub.is_closing() && sub.credit.outstanding() == 0 {
                    self.retire(&sub).await;
                }
                break;
            }
        }
        log::debug!("bridge {} forwarding on {} stopped", self.cfg.name, sub.consumer);
    }

    async fn on_ack(&self, subscription: &str, message_id: &str) {
        let sub = match self.subscriptions.get(subscription) {
            Some(sub) => sub.value().clone(),
            None => {
                log::debug!("bridge {} ack for unknown subscription {}", self.cfg.name, subscription);
                return;
            }
        };
        if sub.credit.release(message_id).is_none() {
            log::debug!("bridge {} ack for {} not outstanding on {}", self.cfg.name, message_id, subscription);
            return;
        }
        if let Err(e) = sub.destination.ack(&sub.consumer, message_id).await {
            log::warn!("bridge {} failed to ack {} on {}, {:?}", self.cfg.name, message_id, sub.destination.name(), e);
        }
        self.inflight.decrement();
        if sub.is_closing() && sub.credit.outstanding() == 0 {
            self.retire(&sub).await;
        }
    }

    /// The peer could not enqueue a forward: its credit comes back, the message returns to
    /// the local destination and the subscription pauses for `redelivery_delay`.
    async fn on_nack(&self, subscription: &str, message_id: &str) {
        let sub = match self.subscriptions.get(subscription) {
            Some(sub) => sub.value().clone(),
            None => {
                log::debug!("bridge {} nack for unknown subscription {}", self.cfg.name, subscription);
                return;
            }
        };
        if sub.credit.release(message_id).is_none() {
            log::debug!("bridge {} nack for {} not outstanding on {}", self.cfg.name, message_id, subscription);
            return;
        }
        *sub.resume_at.lock() = Some(Instant::now() + self.cfg.redelivery_delay);
        sub.destination.stats.forwards.decrement(1);
        if let Err(e) = sub.destination.nack(&sub.consumer, message_id).await {
            log::warn!("bridge {} failed to nack {} on {}, {:?}", self.cfg.name, message_id, sub.destination.name(), e);
        }
        self.inflight.decrement();
        log::debug!("bridge {} broker {} refused {}, pausing {}", self.cfg.name, self.remote, message_id, sub.consumer);
        if sub.is_closing() && sub.credit.outstanding() == 0 {
            self.retire(&sub).await;
        }
    }

    async fn inbound_worker(self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(forward) = rx.recv().await {
            self.receive(forward, false).await;
        }
    }

    /// Enqueues a forwarded message locally and acks it to the peer, or nacks it if it could
    /// not be enqueued while the bridge is still up. With `now` set the message is refused instead of waiting while the
    /// destination is over its usage ceiling.
    async fn receive(&self, forward: Inbound, now: bool) {
        let Inbound { subscription, kind, mut message } = forward;
        let message_id = message.id.clone();
        let enqueued: Result<()> = if self.inbound_cancel.is_cancelled() {
            Err(BrokerError::Cancelled(format!("forward {message_id} after bridge closed")).into())
        } else {
            message.broker_path.push(self.remote);
            let info = DestinationInfo { name: message.destination.clone(), kind, temporary: false };
            match self.ctx.get_or_create_destination(info).await {
                Ok(destination) if now => destination.try_send(message).await.map(|_| ()),
                Ok(destination) => destination.send_until(message, &self.inbound_cancel).await.map(|_| ()),
                Err(e) => Err(e),
            }
        };
        match enqueued {
            Ok(()) => self.send_frame(BridgeFrame::Ack { subscription, message_id }).await,
            //the peer takes its unacknowledged forwards back when the bridge closes
            Err(e) if self.inbound_cancel.is_cancelled() => {
                log::debug!("bridge {} dropped {} from broker {}, {:?}", self.cfg.name, message_id, self.remote, e)
            }
            Err(e) => {
                log::warn!(
                    "bridge {} failed to enqueue {} from broker {}, {:?}",
                    self.cfg.name,
                    message_id,
                    self.remote,
                    e
                );
                self.send_frame(BridgeFrame::Nack { subscription, message_id }).await;
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut subscriptions = self
            .subscription_list()
            .into_iter()
            .map(|s| {
                json!({
                    "id": s.consumer,
                    "destination": s.destination.name(),
                    "kind": s.destination.kind(),
                    "priority": s.demand.priority,
                    "outstanding": s.credit.outstanding(),
                    "closing": s.is_closing(),
                })
            })
            .collect::<Vec<_>>();
        subscriptions.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        json!({
            "name": self.cfg.name,
            "local": self.local,
            "remote": self.remote,
            "state": self.state(),
            "inflight": self.inflight(),
            "subscriptions": subscriptions,
            "last_error": self.last_error().map(|e| e.to_string()),
            "created_at": fedmq_utils::format_timestamp_millis(self.created_at),
        })
    }
}
