use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::BrokerError;
use crate::types::{timestamp_millis, MessageId, SubscriptionId, TimestampMillis};

#[derive(Debug, Clone)]
pub struct OutstandingForward {
    pub message_id: MessageId,
    pub sent_at: TimestampMillis,
}

#[derive(Default)]
struct Window {
    forwards: VecDeque<OutstandingForward>,
    closed: bool,
}

/// Credit window of one upstream subscription.
///
/// At most `cap` forwarded messages may be unacknowledged at a time; each acknowledgement
/// gives one unit of credit back. A closed window hands out no more credit but still takes
/// acknowledgements for what is outstanding.
pub struct CreditWindow {
    subscription: SubscriptionId,
    cap: usize,
    window: Mutex<Window>,
    replenished: Notify,
}

impl CreditWindow {
    #[inline]
    pub fn new(subscription: SubscriptionId, cap: usize) -> Self {
        Self {
            subscription,
            cap: cap.max(1),
            window: Mutex::new(Window::default()),
            replenished: Notify::new(),
        }
    }

    #[inline]
    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.window.lock().forwards.len()
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.outstanding() < self.cap
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.window.lock().closed
    }

    /// Takes one unit of credit for `message_id`.
    pub fn acquire(&self, message_id: MessageId) -> Result<(), BrokerError> {
        let mut window = self.window.lock();
        if window.closed {
            return Err(BrokerError::Cancelled(format!("subscription {} closed", self.subscription)));
        }
        if window.forwards.len() >= self.cap {
            return Err(BrokerError::CreditExhausted { subscription: self.subscription.clone() });
        }
        window.forwards.push_back(OutstandingForward { message_id, sent_at: timestamp_millis() });
        Ok(())
    }

    /// Returns the credit held by `message_id`. Acknowledgements mostly arrive in order, so the
    /// search starts at the oldest forward.
    pub fn release(&self, message_id: &str) -> Option<OutstandingForward> {
        let released = {
            let mut window = self.window.lock();
            let pos = window.forwards.iter().position(|f| f.message_id == message_id)?;
            window.forwards.remove(pos)
        };
        if released.is_some() {
            self.replenished.notify_one();
        }
        released
    }

    /// Resolves once credit has been released since the last wait.
    #[inline]
    pub async fn replenished(&self) {
        self.replenished.notified().await
    }

    /// Waits until one unit of credit is available and takes it. Fails once the window is
    /// closed.
    pub async fn acquire_wait(&self, message_id: MessageId) -> Result<(), BrokerError> {
        loop {
            match self.acquire(message_id.clone()) {
                Ok(()) => return Ok(()),
                Err(e @ BrokerError::CreditExhausted { .. }) => {
                    log::debug!("{}, forwarding paused", e);
                    self.replenished().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops handing out credit, returns the number of forwards still outstanding.
    pub fn close(&self) -> usize {
        let outstanding = {
            let mut window = self.window.lock();
            window.closed = true;
            window.forwards.len()
        };
        self.replenished.notify_waiters();
        outstanding
    }

    /// Forgets every outstanding forward, returning them oldest first.
    pub fn abandon(&self) -> Vec<OutstandingForward> {
        self.window.lock().forwards.drain(..).collect()
    }
}
