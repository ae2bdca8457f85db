use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::{ConsumerInfo, DestinationInfo};

/// Broker-local changes network bridges propagate to their peers.
#[derive(Debug, Clone)]
pub enum DestinationEvent {
    DestinationAdded(DestinationInfo),
    DestinationRemoved(DestinationInfo),
    ConsumerAdded { destination: DestinationInfo, consumer: ConsumerInfo },
    ConsumerRemoved { destination: DestinationInfo, consumer: ConsumerInfo },
}

/// Fan-out of [`DestinationEvent`]s. Subscribers never lag or miss an event.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<DestinationEvent>>>,
}

impl EventBus {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DestinationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn publish(&self, event: DestinationEvent) {
        let closed = {
            let subscribers = self.subscribers.read();
            subscribers.iter().fold(false, |closed, tx| tx.send(event.clone()).is_err() || closed)
        };
        if closed {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }

    #[inline]
    pub fn subscribers(&self) -> usize {
        self.subscribers.read().len()
    }
}
