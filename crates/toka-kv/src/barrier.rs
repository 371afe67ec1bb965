//! Waitable map from published sequence numbers to local observers.

use std::sync::Mutex;

use tokio::sync::oneshot;

use toka_kv_types::error::KvError;

struct Waiter {
    target: u64,
    tx: oneshot::Sender<Result<u64, KvError>>,
}

struct State {
    applied: u64,
    waiters: Vec<Waiter>,
    closed: bool,
}

/// Releases any waiter whose target sequence has been projected.
///
/// Owned by one [`crate::base::Base`]; the Projector releases it as events
/// are applied, and public operations wait on it to get read-your-writes
/// consistency with the log.
pub struct SequenceBarrier {
    state: Mutex<State>,
}

impl SequenceBarrier {
    /// Creates a barrier with nothing yet applied.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                applied: 0,
                waiters: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Waits until an event with sequence `>= target` has been applied,
    /// returning the sequence actually observed. Resolves immediately if
    /// that has already happened.
    pub async fn wait(&self, target: u64) -> Result<u64, KvError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(KvError::InstanceClosed);
            }
            if state.applied >= target {
                return Ok(state.applied);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { target, tx });
            rx
        };
        rx.await
            .unwrap_or(Err(KvError::InstanceClosed))
    }

    /// Releases every waiter with `target <= applied`. Safe to call with a
    /// sequence lower than one already applied; it is simply a no-op for
    /// waiters that were already resolved.
    pub fn release(&self, applied: u64) {
        let mut state = self.state.lock().unwrap();
        if applied > state.applied {
            state.applied = applied;
        }
        let applied = state.applied;
        let mut remaining = Vec::with_capacity(state.waiters.len());
        for waiter in state.waiters.drain(..) {
            if waiter.target <= applied {
                let _ = waiter.tx.send(Ok(applied));
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
    }

    /// Fails every outstanding waiter with [`KvError::InstanceClosed`] and
    /// causes all future `wait` calls to fail the same way.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(KvError::InstanceClosed));
        }
    }
}

impl Default for SequenceBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_immediately_once_already_applied() {
        let barrier = SequenceBarrier::new();
        barrier.release(5);
        let seq = barrier.wait(3).await.unwrap();
        assert_eq!(seq, 5);
    }

    #[tokio::test]
    async fn waiters_release_together_on_a_shared_or_later_sequence() {
        let barrier = std::sync::Arc::new(SequenceBarrier::new());
        let a = barrier.clone();
        let b = barrier.clone();
        let wait_a = tokio::spawn(async move { a.wait(2).await });
        let wait_b = tokio::spawn(async move { b.wait(5).await });
        tokio::task::yield_now().await;
        barrier.release(5);
        assert_eq!(wait_a.await.unwrap().unwrap(), 5);
        assert_eq!(wait_b.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn closing_fails_outstanding_and_future_waiters() {
        let barrier = std::sync::Arc::new(SequenceBarrier::new());
        let waiter = barrier.clone();
        let pending = tokio::spawn(async move { waiter.wait(10).await });
        tokio::task::yield_now().await;
        barrier.close();
        assert!(matches!(pending.await.unwrap(), Err(KvError::InstanceClosed)));
        assert!(matches!(barrier.wait(1).await, Err(KvError::InstanceClosed)));
    }
}
