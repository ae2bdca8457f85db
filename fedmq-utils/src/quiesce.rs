//! Quiescence counter
//!
//! [`CountdownLock`] counts units of in-flight work and lets callers wait until that work
//! has drained. Unlike a one-shot latch, the count may rise again after reaching zero, so a
//! waiter is released by a zero-crossing: either the count is zero when it checks, or the
//! count transitions to zero at some point after it started waiting. Callers that need a
//! hard barrier must stop new increments themselves before waiting.
//!
//! Both blocking waiters (flow-controlled producer threads, admin tooling) and async waiters
//! (bridge drain) are supported. Waiters are woken only on the transition to zero, never on
//! intermediate decrements.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

struct State {
    count: usize,
    //number of transitions to zero so far
    epoch: u64,
}

pub struct CountdownLock {
    state: Mutex<State>,
    zero: Condvar,
    epoch_tx: watch::Sender<u64>,
}

impl Default for CountdownLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CountdownLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountdownLock {{ count: {} }}", self.count())
    }
}

impl CountdownLock {
    #[inline]
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self { state: Mutex::new(State { count: 0, epoch: 0 }), zero: Condvar::new(), epoch_tx }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    #[inline]
    pub fn increment(&self) {
        self.state.lock().count += 1;
    }

    /// Decrements the count, waking every waiter if it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if called more times than [`increment`](Self::increment). That is a caller bug
    /// which would otherwise corrupt later drain and shutdown behaviour.
    #[inline]
    pub fn decrement(&self) {
        let mut state = self.state.lock();
        assert!(state.count > 0, "CountdownLock decremented below zero");
        state.count -= 1;
        if state.count == 0 {
            state.epoch = state.epoch.wrapping_add(1);
            let epoch = state.epoch;
            self.epoch_tx.send_replace(epoch);
            self.zero.notify_all();
        }
    }

    /// Blocks the current thread until the count is zero.
    ///
    /// Returns immediately if the count is zero at the moment of the check.
    pub fn wait_for_zero(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            return;
        }
        let epoch = state.epoch;
        while state.epoch == epoch {
            self.zero.wait(&mut state);
        }
    }

    /// Like [`wait_for_zero`](Self::wait_for_zero) with an upper bound.
    /// Returns `false` if the timeout elapsed first.
    pub fn wait_for_zero_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.count == 0 {
            return true;
        }
        let epoch = state.epoch;
        while state.epoch == epoch {
            if self.zero.wait_until(&mut state, deadline).timed_out() {
                return state.epoch != epoch;
            }
        }
        true
    }

    /// Async variant, resolves on the next zero-crossing (or immediately when already zero).
    pub async fn zeroed(&self) {
        let mut rx = {
            let state = self.state.lock();
            if state.count == 0 {
                return;
            }
            //subscribing under the lock marks the current epoch as seen
            self.epoch_tx.subscribe()
        };
        //the sender lives as long as self, so this only fails if self is gone
        let _ = rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::CountdownLock;

    #[test]
    fn wait_returns_immediately_when_zero() {
        let lock = CountdownLock::new();
        lock.wait_for_zero();
        assert!(lock.wait_for_zero_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wait_blocks_while_positive() {
        let lock = Arc::new(CountdownLock::new());
        lock.increment();
        lock.increment();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lock = lock.clone();
            let released = released.clone();
            thread::spawn(move || {
                lock.wait_for_zero();
                released.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));
        lock.decrement();
        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));
        lock.decrement();
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(lock.count(), 0);
    }

    #[test]
    fn count_may_rise_again_after_zero() {
        let lock = CountdownLock::new();
        lock.increment();
        lock.decrement();
        lock.wait_for_zero();
        lock.increment();
        assert!(!lock.wait_for_zero_timeout(Duration::from_millis(20)));
        lock.decrement();
        assert!(lock.wait_for_zero_timeout(Duration::from_millis(20)));
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn decrement_past_zero_panics() {
        let lock = CountdownLock::new();
        lock.increment();
        lock.decrement();
        lock.decrement();
    }

    #[tokio::test]
    async fn zeroed_resolves_on_transition() {
        let lock = Arc::new(CountdownLock::new());
        lock.zeroed().await;

        lock.increment();
        let l = lock.clone();
        let task = tokio::spawn(async move {
            l.zeroed().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        lock.decrement();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
