use crate::types::{BrokerId, DestinationName, SubscriptionId};

/// Domain errors raised by the statistics, flow control and bridge layers.
///
/// Plumbing code returns [`crate::Result`] (anyhow) and callers that need to branch on the
/// failure recover it with `downcast_ref::<BrokerError>()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("resource exhausted on '{destination}', usage {usage:.2} >= ceiling {ceiling:.2}")]
    ResourceExhausted { destination: DestinationName, usage: f64, ceiling: f64 },

    #[error("network loop detected, broker {remote} is already on the path of broker {local}")]
    LoopDetected { local: BrokerId, remote: BrokerId },

    #[error("a bridge to broker {0} already exists")]
    DuplicateBridge(BrokerId),

    #[error("bridge handshake failed, {0}")]
    BridgeHandshakeFailed(String),

    #[error("forwarding credit exhausted on subscription {subscription}")]
    CreditExhausted { subscription: SubscriptionId },

    #[error("cancelled, {0}")]
    Cancelled(String),

    #[error("destination not found, {0}")]
    DestinationNotFound(DestinationName),

    #[error("invalid statistics parent, {0}")]
    InvalidParent(String),

    #[error("bridge transport closed")]
    TransportClosed,
}

impl BrokerError {
    #[inline]
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, BrokerError::ResourceExhausted { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrokerError::Cancelled(_))
    }
}
