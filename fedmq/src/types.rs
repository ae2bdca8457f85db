use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use fedmq_utils::{timestamp_millis, BrokerId, TimestampMillis};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type DestinationName = ByteString;
pub type MessageId = ByteString;
pub type ConsumerId = ByteString;
pub type SubscriptionId = ByteString;
pub type Priority = i8;

pub type DeliveryTx = mpsc::UnboundedSender<Delivery>;
pub type DeliveryRx = mpsc::UnboundedReceiver<Delivery>;

pub const DEFAULT_PREFETCH: usize = 1000;
pub const DEFAULT_PRIORITY: Priority = 0;
//Priority given to bridge subscriptions when local consumers should be preferred
pub const NETWORK_CONSUMER_PRIORITY: Priority = -5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => write!(f, "queue"),
            DestinationKind::Topic => write!(f, "topic"),
        }
    }
}

/// What a broker advertises about one of its destinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub name: DestinationName,
    pub kind: DestinationKind,
    pub temporary: bool,
}

impl DestinationInfo {
    #[inline]
    pub fn queue<N: Into<DestinationName>>(name: N) -> Self {
        Self { name: name.into(), kind: DestinationKind::Queue, temporary: false }
    }

    #[inline]
    pub fn topic<N: Into<DestinationName>>(name: N) -> Self {
        Self { name: name.into(), kind: DestinationKind::Topic, temporary: false }
    }

    #[inline]
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub destination: DestinationName,
    pub payload: Bytes,
    pub priority: u8,
    pub timestamp: TimestampMillis,
    //0 means never
    pub expiration: TimestampMillis,
    //brokers this message has already left, oldest first
    pub broker_path: Vec<BrokerId>,
    pub redelivered: bool,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("size", &self.size())
            .field("broker_path", &self.broker_path)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Message {
    #[inline]
    pub fn new<D, P>(destination: D, payload: P) -> Self
    where
        D: Into<DestinationName>,
        P: Into<Bytes>,
    {
        Self {
            id: ByteString::from(uuid::Uuid::new_v4().as_simple().to_string()),
            destination: destination.into(),
            payload: payload.into(),
            priority: 4,
            timestamp: timestamp_millis(),
            expiration: 0,
            broker_path: Vec::new(),
            redelivered: false,
        }
    }

    #[inline]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expiration = self.timestamp + ttl.as_millis() as TimestampMillis;
        self
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_expired_at(&self, now: TimestampMillis) -> bool {
        self.expiration > 0 && now >= self.expiration
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(timestamp_millis())
    }

    /// Number of bridges this message has already crossed.
    #[inline]
    pub fn hops(&self) -> usize {
        self.broker_path.len()
    }

    #[inline]
    pub fn traversed(&self, broker: BrokerId) -> bool {
        self.broker_path.contains(&broker)
    }
}

/// Marks a consumer as the local end of a bridge subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOrigin {
    pub remote: BrokerId,
    pub network_ttl: u32,
}

impl NetworkOrigin {
    /// A message may cross to `remote` only if it has hop budget left and has not been there.
    #[inline]
    pub fn may_forward(&self, msg: &Message) -> bool {
        !msg.traversed(self.remote) && msg.hops() < self.network_ttl as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub destination: DestinationName,
    pub prefetch: usize,
    pub priority: Priority,
    pub network: Option<NetworkOrigin>,
}

impl ConsumerInfo {
    #[inline]
    pub fn new<C, D>(id: C, destination: D) -> Self
    where
        C: Into<ConsumerId>,
        D: Into<DestinationName>,
    {
        Self {
            id: id.into(),
            destination: destination.into(),
            prefetch: DEFAULT_PREFETCH,
            priority: DEFAULT_PRIORITY,
            network: None,
        }
    }

    #[inline]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    #[inline]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn network(mut self, origin: NetworkOrigin) -> Self {
        self.network = Some(origin);
        self
    }

    #[inline]
    pub fn is_network(&self) -> bool {
        self.network.is_some()
    }

    #[inline]
    pub fn accepts(&self, msg: &Message) -> bool {
        self.network.as_ref().map(|n| n.may_forward(msg)).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer: ConsumerId,
    pub message: Message,
}
