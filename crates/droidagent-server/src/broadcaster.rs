//! Latest-value fan-out. A [`Broadcaster`] holds one value tagged with a generation counter;
//! each [`Listener`] waits for a generation newer than the last one it returned. Slow listeners
//! skip intermediate values instead of queueing them.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("broadcaster closed")]
    Closed,
    #[error("wait cancelled")]
    Cancelled,
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
    closed: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    generation: 0,
                    value: None,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Stores `value` as generation n+1 and wakes every waiting listener. Returns the new
    /// generation.
    pub fn broadcast(&self, value: T) -> u64 {
        let generation = {
            let mut slot = self.shared.lock();
            slot.generation += 1;
            slot.value = Some(value);
            slot.generation
        };
        self.shared.notify.notify_waiters();
        generation
    }

    /// Closes the broadcaster for good. Pending and future waits fail with
    /// [`BroadcastError::Closed`].
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// New listener that has seen nothing yet, so its first wait returns the current value if
    /// one was ever broadcast.
    pub fn listen(&self) -> Listener<T> {
        Listener {
            shared: Arc::clone(&self.shared),
            seen: 0,
        }
    }
}

pub struct Listener<T> {
    shared: Arc<Shared<T>>,
    seen: u64,
}

impl<T: Clone> Listener<T> {
    /// Waits for a generation newer than the last one returned. Dropping the future abandons the
    /// wait without side effects.
    pub async fn wait(&mut self) -> Result<T, BroadcastError> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a broadcast between the check and the await is seen.
            notified.as_mut().enable();

            if let Some(result) = self.poll_slot() {
                return result;
            }
            notified.await;
        }
    }

    /// Like [`Listener::wait`] but returns [`BroadcastError::Cancelled`] as soon as `cancel`
    /// completes, e.g. `tx.closed()` for a consumer that went away.
    pub async fn wait_or_cancel<F>(&mut self, cancel: F) -> Result<T, BroadcastError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => Err(BroadcastError::Cancelled),
            result = self.wait() => result,
        }
    }

    #[cfg(test)]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    fn poll_slot(&mut self) -> Option<Result<T, BroadcastError>> {
        let slot = self.shared.lock();
        if slot.closed {
            return Some(Err(BroadcastError::Closed));
        }
        if slot.generation > self.seen {
            if let Some(value) = slot.value.as_ref() {
                self.seen = slot.generation;
                return Some(Ok(value.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn listener_gets_current_value_immediately() {
        let b = Broadcaster::new();
        b.broadcast("first");
        let mut l = b.listen();
        assert_eq!(l.wait().await, Ok("first"));
        assert_eq!(l.seen(), 1);
    }

    #[tokio::test]
    async fn second_wait_blocks_until_next_broadcast() {
        let b = Broadcaster::new();
        b.broadcast(1);
        let mut l = b.listen();
        assert_eq!(l.wait().await, Ok(1));
        assert!(timeout(SHORT, l.wait()).await.is_err());

        let publisher = b.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHORT).await;
            publisher.broadcast(2);
        });
        assert_eq!(timeout(Duration::from_secs(5), l.wait()).await.unwrap(), Ok(2));
    }

    #[tokio::test]
    async fn slow_listener_skips_to_latest() {
        let b = Broadcaster::new();
        let mut l = b.listen();
        for i in 1..=5 {
            b.broadcast(i);
        }
        assert_eq!(l.wait().await, Ok(5));
        assert_eq!(l.seen(), 5);
    }

    #[tokio::test]
    async fn generations_never_go_backwards() {
        let b = Broadcaster::new();
        let mut listeners: Vec<_> = (0..4).map(|_| b.listen()).collect();

        let publisher = b.clone();
        let producer = tokio::spawn(async move {
            for i in 1..=200u64 {
                publisher.broadcast(i);
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        let mut readers = Vec::new();
        for mut l in listeners.drain(..) {
            readers.push(tokio::spawn(async move {
                let mut last = 0u64;
                loop {
                    let v = l.wait().await.unwrap();
                    assert!(v > last, "value went from {last} to {v}");
                    assert_eq!(l.seen(), v);
                    last = v;
                    if v == 200 {
                        break;
                    }
                }
            }));
        }

        producer.await.unwrap();
        for r in readers {
            timeout(Duration::from_secs(5), r).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_sticks() {
        let b: Broadcaster<u32> = Broadcaster::new();
        let mut l = b.listen();
        let waiter = tokio::spawn(async move {
            let first = l.wait().await;
            let second = l.wait().await;
            (first, second)
        });

        tokio::time::sleep(SHORT).await;
        b.close();
        let (first, second) = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(first, Err(BroadcastError::Closed));
        assert_eq!(second, Err(BroadcastError::Closed));

        b.broadcast(7);
        assert_eq!(b.listen().wait().await, Err(BroadcastError::Closed));
    }

    #[tokio::test]
    async fn closed_consumer_unblocks_wait() {
        let b: Broadcaster<u32> = Broadcaster::new();
        let mut l = b.listen();
        let (tx, rx) = tokio::sync::mpsc::channel::<u32>(1);

        let waiter = tokio::spawn(async move { l.wait_or_cancel(tx.closed()).await });
        tokio::time::sleep(SHORT).await;
        drop(rx);

        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(BroadcastError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_wins_over_pending_value() {
        let b = Broadcaster::new();
        b.broadcast(3);
        let mut l = b.listen();
        assert_eq!(
            l.wait_or_cancel(std::future::ready(())).await,
            Err(BroadcastError::Cancelled)
        );
        assert_eq!(l.wait_or_cancel(std::future::pending()).await, Ok(3));
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_lose_values() {
        let b = Broadcaster::new();
        let mut l = b.listen();
        assert!(timeout(SHORT, l.wait()).await.is_err());

        b.broadcast("after");
        assert_eq!(l.wait().await, Ok("after"));
    }
}
