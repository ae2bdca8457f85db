//! In-memory queues and topics
//!
//! A [`Destination`] holds pending messages, the consumers attached to it and what each of them
//! has been sent but not yet acknowledged. Queues hand each message to exactly one consumer:
//! the highest priority consumer with prefetch room wins, ties are broken round-robin.
//! Topics copy every message to every consumer. Consumers that are the local end of a network
//! bridge only receive messages that may still cross to their remote broker.
//!
//! Every state change is recorded in the destination's [`DestinationStatistics`].

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::TryStreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fedmq_utils::CountdownLock;

use crate::error::BrokerError;
use crate::event::{DestinationEvent, EventBus};
use crate::governor::{Admission, FlowGovernor, FlowTarget};
use crate::stats::DestinationStatistics;
use crate::store::{recover_stream, AckHandle, MessageStore, RecoveryContext};
use crate::types::{
    timestamp_millis, ConsumerId, ConsumerInfo, Delivery, DeliveryRx, DeliveryTx, DestinationInfo, DestinationKind,
    DestinationName, HashMap, HashSet, Message, MessageId, TimestampMillis,
};
use crate::Result;

#[derive(Debug)]
struct Pending {
    //None for topic copies, which are never stored
    handle: Option<AckHandle>,
    message: Message,
}

struct ConsumerEntry {
    info: ConsumerInfo,
    tx: DeliveryTx,
    unacked: HashMap<MessageId, Pending>,
}

impl ConsumerEntry {
    #[inline]
    fn has_room(&self) -> bool {
        self.unacked.len() < self.info.prefetch && !self.tx.is_closed()
    }

    #[inline]
    fn can_take(&self, msg: &Message) -> bool {
        self.has_room() && self.info.accepts(msg)
    }
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<Pending>,
    consumers: Vec<ConsumerEntry>,
    //round-robin cursor into `consumers`
    next: usize,
    //ids currently pending or unacknowledged
    held: HashSet<MessageId>,
}

impl DispatchState {
    fn select(&mut self, msg: &Message) -> Option<usize> {
        let n = self.consumers.len();
        let best = self.consumers.iter().filter(|c| c.can_take(msg)).map(|c| c.info.priority).max()?;
        let idx = (0..n).map(|i| (self.next + i) % n).find(|&i| {
            let c = &self.consumers[i];
            c.info.priority == best && c.can_take(msg)
        })?;
        self.next = (idx + 1) % n;
        Some(idx)
    }

    #[inline]
    fn position(&self, id: &str) -> Option<usize> {
        self.consumers.iter().position(|c| c.info.id == id)
    }

    #[inline]
    fn unacked(&self) -> usize {
        self.consumers.iter().map(|c| c.unacked.len()).sum()
    }
}

#[derive(Clone)]
pub struct Destination {
    inner: Arc<DestinationInner>,
}

pub struct DestinationInner {
    pub info: DestinationInfo,
    pub stats: DestinationStatistics,
    pub blocked_producers: CountdownLock,
    store: Arc<dyn MessageStore>,
    governor: FlowGovernor,
    events: Arc<EventBus>,
    state: Mutex<DispatchState>,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl Deref for Destination {
    type Target = DestinationInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination {{ {} {} }}", self.info.kind, self.info.name)
    }
}

impl Destination {
    pub fn new(
        info: DestinationInfo,
        stats: DestinationStatistics,
        store: Arc<dyn MessageStore>,
        governor: FlowGovernor,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(DestinationInner {
                info,
                stats,
                blocked_producers: CountdownLock::new(),
                store,
                governor,
                events,
                state: Mutex::new(DispatchState::default()),
                paused: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &DestinationName {
        &self.info.name
    }

    #[inline]
    pub fn kind(&self) -> DestinationKind {
        self.info.kind
    }

    #[inline]
    pub fn is_queue(&self) -> bool {
        self.info.kind == DestinationKind::Queue
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    fn flow_target(&self) -> FlowTarget<'_> {
        FlowTarget {
            destination: &self.info.name,
            stats: &self.stats,
            blocked_producers: &self.blocked_producers,
            cancel: &self.cancel,
        }
    }

    /// Sends `message`, waiting for flow control first.
    ///
    /// A message whose `broker_path` is not empty arrived over a network bridge and is counted
    /// as a network enqueue as well.
    pub async fn send(&self, message: Message) -> Result<Admission> {
        if self.is_closed() {
            return Err(anyhow!("destination {} is closed", self.info.name));
        }
        let size = message.size();
        let admission = self.governor.admit(self.flow_target(), size).await?;
        self.enqueue(message, size).await?;
        Ok(admission)
    }

    /// Like [`send`](Self::send), giving up with `Cancelled` if `until` fires while the send
    /// waits for flow control. Once admitted the message is always enqueued.
    pub async fn send_until(&self, message: Message, until: &CancellationToken) -> Result<Admission> {
        if self.is_closed() {
            return Err(anyhow!("destination {} is closed", self.info.name));
        }
        let size = message.size();
        let admission = tokio::select! {
            biased;
            _ = until.cancelled() => {
                let reason = format!("send to {} while blocked by flow control", self.info.name);
                return Err(BrokerError::Cancelled(reason).into());
            }
            admission = self.governor.admit(self.flow_target(), size) => admission?,
        };
        self.enqueue(message, size).await?;
        Ok(admission)
    }

    /// Like [`send`](Self::send) but refuses with `ResourceExhausted` instead of waiting when
    /// the destination is over its usage ceiling.
    pub async fn try_send(&self, message: Message) -> Result<Admission> {
        if self.is_closed() {
            return Err(anyhow!("destination {} is closed", self.info.name));
        }
        let size = message.size();
        let admission = self.governor.admit_now(self.flow_target(), size)?;
        self.enqueue(message, size).await?;
        Ok(admission)
    }

    async fn enqueue(&self, message: Message, size: usize) -> Result<()> {
        if message.is_expired() {
            log::debug!("{} dropping expired message {}", self.info.name, message.id);
            self.stats.expired.increment(1);
            return Ok(());
        }

        self.stats.enqueues.increment(1);
        if !message.broker_path.is_empty() {
            self.stats.network_enqueues.increment(1);
        }
        self.stats.message_size.add_size(size);

        match self.info.kind {
            DestinationKind::Queue => {
                let handle = self.store.enqueue(&self.info.name, &message).await?;
                self.governor.tracker().add(&self.info.name, size);
                self.stats.messages.increment(1);
                {
                    let mut state = self.state.lock();
                    state.held.insert(message.id.clone());
                    state.pending.push_back(Pending { handle: Some(handle), message });
                    self.stats.messages_cached.set_value(state.pending.len() as i64);
                }
                self.dispatch().await;
            }
            DestinationKind::Topic => self.fan_out(message),
        }
        Ok(())
    }

    fn fan_out(&self, message: Message) {
        let mut state = self.state.lock();
        for c in state.consumers.iter_mut() {
            if c.tx.is_closed() || !c.info.accepts(&message) {
                continue;
            }
            let delivery = Delivery { consumer: c.info.id.clone(), message: message.clone() };
            if c.tx.send(delivery).is_ok() {
                c.unacked.insert(message.id.clone(), Pending { handle: None, message: message.clone() });
                self.stats.dispatched.increment(1);
                self.stats.inflight.increment(1);
            }
        }
    }

    /// Hands pending queue messages to consumers with room, dropping any that expired.
    pub async fn dispatch(&self) {
        if self.is_paused() {
            return;
        }
        let expired = {
            let mut state = self.state.lock();
            self.dispatch_locked(&mut state)
        };
        self.drop_expired(expired).await;
    }

    fn dispatch_locked(&self, state: &mut DispatchState) -> Vec<Pending> {
        let now = timestamp_millis();
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.pending.len());
        while let Some(p) = state.pending.pop_front() {
            if p.message.is_expired_at(now) {
                state.held.remove(&p.message.id);
                expired.push(p);
                continue;
            }
            if !state.consumers.iter().any(|c| c.has_room()) {
                remaining.push_back(p);
                remaining.extend(state.pending.drain(..));
                break;
            }
            match state.select(&p.message) {
                Some(idx) => {
                    let c = &mut state.consumers[idx];
                    let delivery = Delivery { consumer: c.info.id.clone(), message: p.message.clone() };
                    if c.tx.send(delivery).is_ok() {
                        c.unacked.insert(p.message.id.clone(), p);
                        self.stats.dispatched.increment(1);
                        self.stats.inflight.increment(1);
                    } else {
                        remaining.push_back(p);
                    }
                }
                None => remaining.push_back(p),
            }
        }
        state.pending = remaining;
        self.stats.messages_cached.set_value(state.pending.len() as i64);
        expired
    }

    async fn drop_expired(&self, expired: Vec<Pending>) {
        for p in expired {
            log::debug!("{} message {} expired", self.info.name, p.message.id);
            self.stats.expired.increment(1);
            if let Some(handle) = p.handle {
                self.stats.messages.decrement(1);
                self.governor.tracker().remove(&self.info.name, p.message.size());
                if let Err(e) = self.store.dequeue(&self.info.name, handle).await {
                    log::warn!("{} failed to remove expired message {}, {:?}", self.info.name, p.message.id, e);
                }
            }
        }
    }

    /// Removes every pending message that has expired, returns how many were removed.
    pub async fn expire_messages(&self) -> usize {
        let now = timestamp_millis();
        let expired: Vec<Pending> = {
            let mut state = self.state.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) =
                state.pending.drain(..).partition(|p| p.message.is_expired_at(now));
            state.pending = kept;
            for p in expired.iter() {
                state.held.remove(&p.message.id);
            }
            self.stats.messages_cached.set_value(state.pending.len() as i64);
            expired.into_iter().collect()
        };
        let n = expired.len();
        self.drop_expired(expired).await;
        n
    }

    pub async fn add_consumer(&self, info: ConsumerInfo) -> Result<DeliveryRx> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if state.position(&info.id).is_some() {
                return Err(anyhow!("consumer {} already exists on {}", info.id, self.info.name));
            }
            log::debug!("{} consumer added {:?}", self.info.name, info);
            state.consumers.push(ConsumerEntry { info: info.clone(), tx, unacked: HashMap::default() });
            self.stats.consumers.increment(1);
            self.events.publish(DestinationEvent::ConsumerAdded { destination: self.info.clone(), consumer: info });
        }
        self.dispatch().await;
        Ok(rx)
    }

    /// Detaches a consumer. Queue messages it had not acknowledged go back to the head of the
    /// queue marked redelivered, unacknowledged topic copies are discarded.
    pub async fn remove_consumer(&self, id: &str) -> Result<usize> {
        let returned = {
            let mut state = self.state.lock();
            let idx = state.position(id).ok_or_else(|| anyhow!("consumer {} not found on {}", id, self.info.name))?;
            let entry = state.consumers.remove(idx);
            if state.next > idx {
                state.next -= 1;
            }
            if state.next >= state.consumers.len() {
                state.next = 0;
            }
            self.stats.consumers.decrement(1);

            let mut unacked: Vec<Pending> = entry.unacked.into_values().collect();
            let n = unacked.len();
            self.stats.inflight.decrement(n as i64);
            //dispatched but never acknowledged, so it is dispatched again later
            self.stats.dispatched.decrement(n as i64);
            if self.is_queue() {
                unacked.sort_by_key(|p| p.handle);
                for mut p in unacked.into_iter().rev() {
                    p.message.redelivered = true;
                    state.pending.push_front(p);
                }
                self.stats.messages_cached.set_value(state.pending.len() as i64);
            }
            log::debug!("{} consumer removed {}, {} unacknowledged", self.info.name, id, n);
            self.events.publish(DestinationEvent::ConsumerRemoved {
                destination: self.info.clone(),
                consumer: entry.info,
            });
            n
        };
        self.dispatch().await;
        Ok(returned)
    }

    /// Acknowledges a message previously delivered to `consumer`.
    pub async fn ack(&self, consumer: &str, message_id: &str) -> Result<()> {
        let (pending, network) = {
            let mut state = self.state.lock();
            let idx = state
                .position(consumer)
                .ok_or_else(|| anyhow!("consumer {} not found on {}", consumer, self.info.name))?;
            let c = &mut state.consumers[idx];
            let network = c.info.is_network();
            let pending = c
                .unacked
                .remove(message_id)
                .ok_or_else(|| anyhow!("message {} is not in flight to {}", message_id, consumer))?;
            if pending.handle.is_some() {
                state.held.remove(message_id);
            }
            (pending, network)
        };

        self.stats.dequeues.increment(1);
        self.stats.inflight.decrement(1);
        if network {
            self.stats.network_dequeues.increment(1);
        }
        let held_for = (timestamp_millis() - pending.message.timestamp).max(0) as u64;
        self.stats.process_time.add_time(Duration::from_millis(held_for));

        if let Some(handle) = pending.handle {
            self.stats.messages.decrement(1);
            self.governor.tracker().remove(&self.info.name, pending.message.size());
            self.store.dequeue(&self.info.name, handle).await?;
        }
        self.dispatch().await;
        Ok(())
    }

    /// Takes back a message delivered to `consumer` without acknowledging it. A queue message
    /// returns to the head of the queue marked redelivered, a topic copy is dropped.
    pub async fn nack(&self, consumer: &str, message_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let idx = state
                .position(consumer)
                .ok_or_else(|| anyhow!("consumer {} not found on {}", consumer, self.info.name))?;
            let mut pending = state.consumers[idx]
                .unacked
                .remove(message_id)
                .ok_or_else(|| anyhow!("message {} is not in flight to {}", message_id, consumer))?;
            self.stats.inflight.decrement(1);
            self.stats.dispatched.decrement(1);
            if pending.handle.is_some() {
                pending.message.redelivered = true;
                state.pending.push_front(pending);
                self.stats.messages_cached.set_value(state.pending.len() as i64);
            }
        }
        self.dispatch().await;
        Ok(())
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stops handing messages to consumers. Acknowledgements keep working.
    #[inline]
    pub fn pause(&self) {
        log::info!("{} paused", self.info.name);
        self.paused.store(true, Ordering::SeqCst);
    }

    pub async fn resume(&self) {
        log::info!("{} resumed", self.info.name);
        self.paused.store(false, Ordering::SeqCst);
        self.dispatch().await;
    }

    /// Pages messages back in from the store. Messages already held count as duplicates,
    /// messages that expired while stored are removed once paging is done.
    pub async fn recover(&self) -> Result<usize> {
        if !self.is_queue() {
            return Ok(0);
        }
        let stream = recover_stream(self.store.clone(), self.info.name.clone(), RecoveryContext::default());
        futures::pin_mut!(stream);
        let mut recovered = 0;
        let mut expired = Vec::new();
        let now: TimestampMillis = timestamp_millis();
        while let Some(stored) = stream.try_next().await? {
            let mut state = self.state.lock();
            if state.held.contains(&stored.message.id) {
                self.stats.duplicate_from_store.increment(1);
            } else if stored.message.is_expired_at(now) {
                expired.push(stored.handle);
            } else {
                state.held.insert(stored.message.id.clone());
                self.governor.tracker().add(&self.info.name, stored.message.size());
                self.stats.messages.increment(1);
                state.pending.push_back(Pending { handle: Some(stored.handle), message: stored.message });
                recovered += 1;
            }
        }
        for handle in expired {
            self.stats.expired.increment(1);
            self.store.dequeue(&self.info.name, handle).await?;
        }
        if recovered > 0 {
            log::info!("{} recovered {} messages from store", self.info.name, recovered);
        }
        self.dispatch().await;
        Ok(recovered)
    }

    /// Cancels producers parked by flow control and refuses further sends.
    pub fn close(&self) {
        log::info!("{} closed, {} producers blocked", self.info.name, self.blocked_producers.count());
        self.cancel.cancel();
    }

    #[inline]
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.state.lock().consumers.iter().map(|c| c.info.clone()).collect()
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[inline]
    pub fn unacked(&self, consumer: &ConsumerId) -> usize {
        let state = self.state.lock();
        state.position(consumer).map(|i| state.consumers[i].unacked.len()).unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let (pending, unacked, consumers) = {
            let state = self.state.lock();
            (state.pending.len(), state.unacked(), state.consumers.len())
        };
        json!({
            "name": self.info.name,
            "kind": self.info.kind,
            "temporary": self.info.temporary,
            "paused": self.is_paused(),
            "pending": pending,
            "unacked": unacked,
            "consumers": consumers,
            "blocked_producers": self.blocked_producers.count(),
            "stats": self.stats.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fedmq_conf::FlowControl;
    use fedmq_utils::Bytesize;

    use super::*;
    use crate::governor::MemoryUsage;
    use crate::statistic::StatisticTree;
    use crate::store::MemoryMessageStore;
    use crate::types::{NetworkOrigin, NETWORK_CONSUMER_PRIORITY};

    fn destination(info: DestinationInfo) -> (Destination, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new());
        let usage = Arc::new(MemoryUsage::new(Bytesize::from("1M")));
        let governor = FlowGovernor::new(FlowControl::default(), usage);
        let stats = DestinationStatistics::new(&StatisticTree::new());
        (Destination::new(info, stats, store.clone(), governor, Arc::new(EventBus::new())), store)
    }

    fn drain(rx: &mut DeliveryRx) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn queue_round_robin_and_ack() {
        let (q, store) = destination(DestinationInfo::queue("orders"));
        let mut c1 = q.add_consumer(ConsumerInfo::new("c1", "orders")).await.unwrap();
        let mut c2 = q.add_consumer(ConsumerInfo::new("c2", "orders")).await.unwrap();
        for i in 0..10 {
            q.send(Message::new("orders", format!("m{i}"))).await.unwrap();
        }
        let d1 = drain(&mut c1);
        let d2 = drain(&mut c2);
        assert_eq!((d1.len(), d2.len()), (5, 5));
        assert_eq!(q.stats.dispatched.value(), 10);
        assert_eq!(q.stats.inflight.value(), 10);
        assert_eq!(q.stats.messages.value(), 10);

        for d in d1.iter().chain(d2.iter()) {
            q.ack(&d.consumer, &d.message.id).await.unwrap();
        }
        assert_eq!(q.stats.dequeues.value(), 10);
        assert_eq!(q.stats.inflight.value(), 0);
        assert_eq!(q.stats.messages.value(), 0);
        assert_eq!(q.stats.process_time.sample().count, 10);
        assert_eq!(store.count(q.name()).await.unwrap(), 0);
        assert!(q.ack("c1", &d1[0].message.id).await.is_err());
    }

    #[tokio::test]
    async fn prefetch_and_priority() {
        let (q, _) = destination(DestinationInfo::queue("orders"));
        let mut local = q.add_consumer(ConsumerInfo::new("local", "orders").prefetch(3)).await.unwrap();
        let origin = NetworkOrigin { remote: 2, network_ttl: 1 };
        let mut net = q
            .add_consumer(ConsumerInfo::new("net", "orders").priority(NETWORK_CONSUMER_PRIORITY).network(origin))
            .await
            .unwrap();
        for _ in 0..5 {
            q.send(Message::new("orders", "x")).await.unwrap();
        }
        let l = drain(&mut local);
        let n = drain(&mut net);
        assert_eq!((l.len(), n.len()), (3, 2));

        //network consumers never see a message that already left their remote broker
        let mut m = Message::new("orders", "y");
        m.broker_path.push(2);
        q.send(m).await.unwrap();
        assert!(drain(&mut net).is_empty());
        assert_eq!(q.pending(), 1);
        assert_eq!(q.stats.network_enqueues.value(), 1);

        q.ack("local", &l[0].message.id).await.unwrap();
        assert_eq!(drain(&mut local).len(), 1);
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn removed_consumer_messages_are_redelivered() {
        let (q, _) = destination(DestinationInfo::queue("orders"));
        let mut c1 = q.add_consumer(ConsumerInfo::new("c1", "orders")).await.unwrap();
        for _ in 0..3 {
            q.send(Message::new("orders", "x")).await.unwrap();
        }
        let first = drain(&mut c1);
        assert_eq!(q.remove_consumer("c1").await.unwrap(), 3);
        assert_eq!(q.stats.inflight.value(), 0);
        assert_eq!(q.stats.consumers.value(), 0);
        assert_eq!(q.pending(), 3);

        let mut c2 = q.add_consumer(ConsumerInfo::new("c2", "orders")).await.unwrap();
        let again = drain(&mut c2);
        assert_eq!(again.len(), 3);
        assert!(again.iter().all(|d| d.message.redelivered));
        let ids: Vec<_> = first.iter().map(|d| d.message.id.clone()).collect();
        let ids2: Vec<_> = again.iter().map(|d| d.message.id.clone()).collect();
        assert_eq!(ids, ids2);
    }

    #[tokio::test]
    async fn topic_copies_to_everyone() {
        let (t, store) = destination(DestinationInfo::topic("prices"));
        let mut a = t.add_consumer(ConsumerInfo::new("a", "prices")).await.unwrap();
        let mut b = t.add_consumer(ConsumerInfo::new("b", "prices")).await.unwrap();
        t.send(Message::new("prices", "1")).await.unwrap();
        let da = drain(&mut a);
        assert_eq!(da.len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
        assert_eq!(t.stats.dispatched.value(), 2);
        assert_eq!(t.stats.messages.value(), 0);
        assert_eq!(store.count(t.name()).await.unwrap(), 0);
        t.ack("a", &da[0].message.id).await.unwrap();
        assert_eq!(t.stats.inflight.value(), 1);
    }

    #[tokio::test]
    async fn pause_expire_and_recover() {
        let (q, store) = destination(DestinationInfo::queue("orders"));
        q.pause();
        let mut c = q.add_consumer(ConsumerInfo::new("c", "orders")).await.unwrap();
        q.send(Message::new("orders", "keep")).await.unwrap();
        q.send(Message::new("orders", "gone").with_ttl(Duration::from_millis(20))).await.unwrap();
        assert!(drain(&mut c).is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(q.expire_messages().await, 1);
        assert_eq!(q.stats.expired.value(), 1);
        assert_eq!(q.stats.messages.value(), 1);

        //everything held is already pending, so the store only yields duplicates
        assert_eq!(q.recover().await.unwrap(), 0);
        assert_eq!(q.stats.duplicate_from_store.value(), 1);

        q.resume().await;
        assert_eq!(drain(&mut c).len(), 1);

        //a fresh destination over the same store pages the unacknowledged message back in
        let usage = Arc::new(MemoryUsage::new(Bytesize::from("1M")));
        let fresh = Destination::new(
            DestinationInfo::queue("orders"),
            DestinationStatistics::new(&StatisticTree::new()),
            store,
            FlowGovernor::new(FlowControl::default(), usage),
            Arc::new(EventBus::new()),
        );
        assert_eq!(fresh.recover().await.unwrap(), 1);
        assert_eq!(fresh.stats.messages.value(), 1);
    }

    #[tokio::test]
    async fn recover_pages_past_expired_messages() {
        let store = Arc::new(MemoryMessageStore::new());
        let name = DestinationName::from("orders");
        let mut live = Vec::new();
        for i in 0..150 {
            let m = Message::new("orders", format!("m{i}"));
            let m = if i < 10 { m.with_ttl(Duration::from_millis(1)) } else { m };
            store.enqueue(&name, &m).await.unwrap();
            if i >= 10 {
                live.push(m.id.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let usage = Arc::new(MemoryUsage::new(Bytesize::from("1M")));
        let q = Destination::new(
            DestinationInfo::queue("orders"),
            DestinationStatistics::new(&StatisticTree::new()),
            store.clone(),
            FlowGovernor::new(FlowControl::default(), usage),
            Arc::new(EventBus::new()),
        );
        assert_eq!(q.recover().await.unwrap(), 140);
        assert_eq!(q.pending(), 140);
        assert_eq!(q.stats.messages.value(), 140);
        assert_eq!(q.stats.expired.value(), 10);
        assert_eq!(store.count(&name).await.unwrap(), 140);

        let mut c = q.add_consumer(ConsumerInfo::new("c", "orders").prefetch(1000)).await.unwrap();
        let ids: Vec<_> = drain(&mut c).into_iter().map(|d| d.message.id).collect();
        assert_eq!(ids, live);
    }

    #[tokio::test]
    async fn inflight_tracks_dispatched_minus_dequeues() {
        let (q, _) = destination(DestinationInfo::queue("orders"));
        let balanced = |q: &Destination| {
            assert_eq!(
                q.stats.inflight.value(),
                q.stats.dispatched.value() - q.stats.dequeues.value(),
                "{}",
                q.stats.to_json()
            )
        };
        let mut c1 = q.add_consumer(ConsumerInfo::new("c1", "orders").prefetch(3)).await.unwrap();
        let mut c2 = q.add_consumer(ConsumerInfo::new("c2", "orders").prefetch(3)).await.unwrap();
        for _ in 0..8 {
            q.send(Message::new("orders", "x")).await.unwrap();
        }
        let d1 = drain(&mut c1);
        let d2 = drain(&mut c2);
        assert_eq!((d1.len(), d2.len(), q.pending()), (3, 3, 2));
        balanced(&q);

        q.ack("c1", &d1[0].message.id).await.unwrap();
        balanced(&q);
        q.nack("c2", &d2[0].message.id).await.unwrap();
        balanced(&q);
        assert!(q.nack("c1", &d1[0].message.id).await.is_err());

        //c1 had 2 unacknowledged plus 1 refill, all of them go back to the queue
        let refilled = drain(&mut c1);
        assert_eq!(q.remove_consumer("c1").await.unwrap(), 2 + refilled.len());
        balanced(&q);

        let mut c3 = q.add_consumer(ConsumerInfo::new("c3", "orders").prefetch(100)).await.unwrap();
        let redelivered = drain(&mut c3);
        assert!(redelivered.iter().any(|d| d.message.redelivered));
        balanced(&q);
        for d in redelivered.iter() {
            q.ack("c3", &d.message.id).await.unwrap();
        }
        for d in drain(&mut c2).iter().chain(d2[1..].iter()) {
            q.ack("c2", &d.message.id).await.unwrap();
        }
        balanced(&q);
        assert_eq!(q.stats.inflight.value(), 0);
        assert_eq!(q.stats.dequeues.value(), 8);
        assert_eq!(q.stats.messages.value(), 0);
    }

    #[tokio::test]
    async fn try_send_refuses_over_the_ceiling() {
        let store = Arc::new(MemoryMessageStore::new());
        let usage = Arc::new(MemoryUsage::new(Bytesize::from("1M")));
        let governor = FlowGovernor::new(FlowControl::default(), usage.clone());
        let stats = DestinationStatistics::new(&StatisticTree::new());
        let events = Arc::new(EventBus::new());
        let q = Destination::new(DestinationInfo::queue("orders"), stats, store.clone(), governor, events);

        usage.set_usage_ratio(Some(1.0));
        let res = tokio::time::timeout(Duration::from_secs(1), q.try_send(Message::new("orders", "x"))).await.unwrap();
        assert!(matches!(res.unwrap_err().downcast_ref::<BrokerError>(), Some(BrokerError::ResourceExhausted { .. })));
        assert_eq!(q.stats.blocked_sends.value(), 1);
        assert_eq!(q.blocked_producers.count(), 0);
        assert_eq!(q.pending(), 0);

        usage.set_usage_ratio(None);
        assert_eq!(q.try_send(Message::new("orders", "y")).await.unwrap(), Admission::Allowed);
        assert_eq!(q.pending(), 1);
        assert_eq!(store.count(q.name()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn send_until_gives_up_when_cancelled() {
        let store = Arc::new(MemoryMessageStore::new());
        let usage = Arc::new(MemoryUsage::new(Bytesize::from("1M")));
        let cfg = FlowControl { poll_interval: Duration::from_millis(10), ..Default::default() };
        let stats = DestinationStatistics::new(&StatisticTree::new());
        let q = Arc::new(Destination::new(
            DestinationInfo::queue("orders"),
            stats,
            store.clone(),
            FlowGovernor::new(cfg, usage.clone()),
            Arc::new(EventBus::new()),
        ));
        usage.set_usage_ratio(Some(1.0));

        let until = CancellationToken::new();
        let task = {
            let (q, until) = (q.clone(), until.clone());
            tokio::spawn(async move { q.send_until(Message::new("orders", "x"), &until).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.blocked_producers.count(), 1);
        until.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::Cancelled(_))));
        assert_eq!(q.blocked_producers.count(), 0);

        //usage dropping later must not resurrect the send
        usage.set_usage_ratio(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.pending(), 0);
        assert_eq!(q.stats.enqueues.value(), 0);
        assert_eq!(store.count(q.name()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_rejects_sends() {
        let (q, _) = destination(DestinationInfo::queue("orders"));
        q.close();
        assert!(q.send(Message::new("orders", "x")).await.is_err());
    }
}
