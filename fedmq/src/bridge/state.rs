//! Bridge lifecycle as a pure state machine
//!
//! ```text
//! Connecting -> Handshaking -> Active -> Draining -> Closed
//!      \             \                     ^
//!       \             +-- loop / timeout --+--> Closed
//!        +-- transport failure or stop ----+
//! ```
//!
//! [`transition`] never performs I/O; the bridge driver executes the returned [`Effect`]s.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::BrokerId;

use super::transport::BrokerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Connecting,
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl BridgeState {
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, BridgeState::Closed)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, BridgeState::Active)
    }
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Registered,
    RemoteInfo(BrokerInfo),
    HandshakeTimeout,
    TransportFailed(String),
    Stop,
    RemoteShutdown,
    Drained,
    DrainTimeout,
}

#[derive(Debug, Clone)]
pub enum Effect {
    SendBrokerInfo,
    StartHandshakeTimer,
    Advertise,
    StopForwarding,
    SendShutdown,
    WaitForDrain,
    AbandonInflight,
    Unregister,
    CloseTransport,
    Fail(BrokerError),
}

/// The identities a transition is checked against.
#[derive(Debug, Clone, Copy)]
pub struct Peers {
    pub local: BrokerId,
    //identity the transport negotiated
    pub remote: BrokerId,
}

#[inline]
fn close_with(err: BrokerError) -> (BridgeState, Vec<Effect>) {
    (BridgeState::Closed, vec![Effect::Fail(err), Effect::Unregister, Effect::CloseTransport])
}

pub fn transition(peers: Peers, state: BridgeState, event: BridgeEvent) -> (BridgeState, Vec<Effect>) {
    use BridgeEvent as E;
    use BridgeState as S;

    match (state, event) {
        (S::Closed, _) => (S::Closed, Vec::new()),

        (S::Connecting, E::Registered) => (S::Handshaking, vec![Effect::SendBrokerInfo, Effect::StartHandshakeTimer]),

        (S::Handshaking, E::RemoteInfo(info)) => {
            if info.id == peers.local || info.network_path.contains(&peers.local) || info.network_path.contains(&info.id)
            {
                close_with(BrokerError::LoopDetected { local: peers.local, remote: info.id })
            } else if info.id != peers.remote {
                close_with(BrokerError::BridgeHandshakeFailed(format!(
                    "expected broker {}, peer identified as {}",
                    peers.remote, info.id
                )))
            } else {
                (S::Active, vec![Effect::Advertise])
            }
        }
        (S::Handshaking, E::HandshakeTimeout) => {
            close_with(BrokerError::BridgeHandshakeFailed("timed out waiting for broker info".into()))
        }

        (S::Connecting | S::Handshaking | S::Active, E::Stop) => {
            (S::Draining, vec![Effect::StopForwarding, Effect::SendShutdown, Effect::WaitForDrain])
        }
        (S::Connecting | S::Handshaking | S::Active, E::TransportFailed(_) | E::RemoteShutdown) => {
            (S::Draining, vec![Effect::StopForwarding, Effect::WaitForDrain])
        }

        (S::Draining, E::Drained) => (S::Closed, vec![Effect::Unregister, Effect::CloseTransport]),
        (S::Draining, E::DrainTimeout) => {
            (S::Closed, vec![Effect::AbandonInflight, Effect::Unregister, Effect::CloseTransport])
        }

        (state, _) => (state, Vec::new()),
    }
}
