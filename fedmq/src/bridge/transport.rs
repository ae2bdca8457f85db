use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::types::{BrokerId, ConsumerId, DestinationInfo, DestinationKind, Message, MessageId, Priority, SubscriptionId};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub name: String,
    //brokers this connection was relayed through, empty for a direct connection
    pub network_path: Vec<BrokerId>,
}

/// A consumer attached to the sending broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConsumer {
    pub destination: DestinationInfo,
    pub consumer: ConsumerId,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Advertisement {
    pub destinations: Vec<DestinationInfo>,
    pub consumers: Vec<RemoteConsumer>,
}

/// Decoded bridge protocol frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BridgeFrame {
    BrokerInfo(BrokerInfo),
    Advertise(Advertisement),
    //the destination no longer exists on the sending broker
    Withdraw(DestinationInfo),
    ConsumerAdded(RemoteConsumer),
    ConsumerRemoved(RemoteConsumer),
    Forward { subscription: SubscriptionId, kind: DestinationKind, message: Message },
    Ack { subscription: SubscriptionId, message_id: MessageId },
    //the forward could not be enqueued and should be redelivered later
    Nack { subscription: SubscriptionId, message_id: MessageId },
    Shutdown,
}

impl BridgeFrame {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            BridgeFrame::BrokerInfo(_) => "BrokerInfo",
            BridgeFrame::Advertise(_) => "Advertise",
            BridgeFrame::Withdraw(_) => "Withdraw",
            BridgeFrame::ConsumerAdded(_) => "ConsumerAdded",
            BridgeFrame::ConsumerRemoved(_) => "ConsumerRemoved",
            BridgeFrame::Forward { .. } => "Forward",
            BridgeFrame::Ack { .. } => "Ack",
            BridgeFrame::Nack { .. } => "Nack",
            BridgeFrame::Shutdown => "Shutdown",
        }
    }
}

/// An established, already authenticated connection to another broker.
#[async_trait]
pub trait BridgeTransport: Send + Sync + 'static {
    ///Identity of the peer, negotiated when the connection was established.
    fn remote_identity(&self) -> BrokerId;

    async fn send(&self, frame: BridgeFrame) -> Result<()>;

    ///Next frame from the peer, `None` once the connection is gone.
    async fn recv(&self) -> Option<BridgeFrame>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One end of an in-process connection, see [`pair`].
pub struct MemoryTransport {
    local: BrokerId,
    remote: BrokerId,
    tx: mpsc::UnboundedSender<BridgeFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<BridgeFrame>>,
    closed: CancellationToken,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryTransport {{ {} -> {}, closed: {} }}", self.local, self.remote, self.is_closed())
    }
}

/// Two connected transport ends, the first held by broker `a`, the second by broker `b`.
/// Closing either end closes the connection for both.
pub fn pair(a: BrokerId, b: BrokerId) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    (
        MemoryTransport { local: a, remote: b, tx: a_tx, rx: Mutex::new(a_rx), closed: closed.clone() },
        MemoryTransport { local: b, remote: a, tx: b_tx, rx: Mutex::new(b_rx), closed },
    )
}

#[async_trait]
impl BridgeTransport for MemoryTransport {
    #[inline]
    fn remote_identity(&self) -> BrokerId {
        self.remote
    }

    async fn send(&self, frame: BridgeFrame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::TransportClosed.into());
        }
        self.tx.send(frame).map_err(|_| BrokerError::TransportClosed)?;
        Ok(())
    }

    async fn recv(&self) -> Option<BridgeFrame> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = self.closed.cancelled() => {
                //hand over what the peer sent before closing
                rx.try_recv().ok()
            }
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            log::debug!("transport {} -> {} closed", self.local, self.remote);
            self.closed.cancel();
        }
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_and_close_is_shared() {
        let (a, b) = pair(1, 2);
        assert_eq!(a.remote_identity(), 2);
        assert_eq!(b.remote_identity(), 1);

        a.send(BridgeFrame::Shutdown).await.unwrap();
        assert!(matches!(b.recv().await, Some(BridgeFrame::Shutdown)));

        b.send(BridgeFrame::Shutdown).await.unwrap();
        b.close().await;
        //frames sent before the close are still delivered
        assert!(matches!(a.recv().await, Some(BridgeFrame::Shutdown)));
        assert!(a.recv().await.is_none());
        assert!(a.is_closed());
        let err = a.send(BridgeFrame::Shutdown).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::TransportClosed)));
    }
}
