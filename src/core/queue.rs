//! Bounded queue with explicit eviction policies.
//!
//! - Pushes never block: on a full queue the caller supplies an eviction
//!   predicate naming a victim, or the push is refused.
//! - A single consumer is assumed; multiple producers are safe.
//! - `drop_where` supports epoch compaction (bulk-invalidate stale items).
//!
//! The lock is a `parking_lot::Mutex` and is never held across an await point;
//! consumers use the enable-before-check `Notify` pattern so wakeups between
//! the check and the await are not lost.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue closed")]
pub struct QueueClosed;

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Admitted after evicting a victim named by the predicate.
    PushedAfterEvict,
    /// Queue full (no victim matched) or closed.
    Refused,
}

impl PushOutcome {
    pub fn admitted(&self) -> bool {
        !matches!(self, PushOutcome::Refused)
    }

    pub fn evicted(&self) -> bool {
        matches!(self, PushOutcome::PushedAfterEvict)
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Push without an eviction policy. Returns false if full or closed.
    pub fn try_push(&self, item: T) -> bool {
        self.push_or_evict(item, |_| false).admitted()
    }

    /// Push, evicting the first item matching `evict` if the queue is full.
    pub fn push_or_evict(&self, item: T, evict: impl Fn(&T) -> bool) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Refused;
            }
            let mut evicted = false;
            if inner.items.len() >= self.capacity {
                if let Some(victim) = inner.items.iter().position(&evict) {
                    inner.items.remove(victim);
                    evicted = true;
                }
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                if evicted {
                    PushOutcome::PushedAfterEvict
                } else {
                    PushOutcome::Pushed
                }
            } else {
                PushOutcome::Refused
            }
        };
        if outcome.admitted() {
            self.notify.notify_waiters();
        }
        outcome
    }

    /// Dequeue FIFO.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        self.pop_prefer(|_| false).await
    }

    /// Dequeue the first item matching `prefer`, else FIFO.
    pub async fn pop_prefer(&self, prefer: impl Fn(&T) -> bool) -> Result<T, QueueClosed> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(idx) = inner.items.iter().position(&prefer) {
                    return Ok(inner.items.remove(idx).expect("indexed item"));
                }
                if let Some(item) = inner.items.pop_front() {
                    return Ok(item);
                }
                if inner.closed {
                    return Err(QueueClosed);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Block until any queued item matches `pred`. Does not consume it.
    pub async fn wait_for_any(&self, pred: impl Fn(&T) -> bool) -> Result<(), QueueClosed> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.items.iter().any(&pred) {
                    return Ok(());
                }
                if inner.closed {
                    return Err(QueueClosed);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Remove every queued item matching `pred`; returns how many were dropped.
    pub fn drop_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            let before = inner.items.len();
            inner.items.retain(|x| !pred(x));
            before - inner.items.len()
        };
        if dropped > 0 {
            self.notify.notify_waiters();
        }
        dropped
    }

    /// Remove the oldest item matching `pred`, if any.
    pub fn evict_one_where(&self, pred: impl Fn(&T) -> bool) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            match inner.items.iter().position(&pred) {
                Some(idx) => {
                    inner.items.remove(idx);
                    true
                }
                None => false,
            }
        };
        if evicted {
            self.notify.notify_waiters();
        }
        evicted
    }

    pub fn any_where(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.inner.lock().items.iter().any(pred)
    }

    /// Close the queue, waking all waiters. Pending items remain poppable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_and_prefer() {
        let q = BoundedQueue::new(8);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(q.try_push(3));
        assert_eq!(q.pop_prefer(|x| *x == 3).await, Ok(3));
        assert_eq!(q.pop().await, Ok(1));
        assert_eq!(q.pop().await, Ok(2));
    }

    #[tokio::test]
    async fn full_queue_refuses_without_victim() {
        let q = BoundedQueue::new(2);
        assert!(q.try_push(10));
        assert!(q.try_push(20));
        assert!(!q.try_push(30));
        // Evicting the oldest even number admits the new item.
        assert_eq!(
            q.push_or_evict(30, |x| x % 2 == 0),
            PushOutcome::PushedAfterEvict
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, Ok(20));
        assert_eq!(q.pop().await, Ok(30));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        assert!(q.try_push(7));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Ok(7));
    }

    #[tokio::test]
    async fn wait_for_any_sees_later_push() {
        let q = Arc::new(BoundedQueue::new(4));
        assert!(q.try_push(1));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.wait_for_any(|x| *x == 9).await });
        tokio::task::yield_now().await;
        assert!(q.try_push(9));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_and_drains() {
        let q = BoundedQueue::new(4);
        assert!(q.try_push(1));
        q.close();
        assert!(!q.try_push(2));
        // Items pushed before close still drain, then the queue reports closed.
        assert_eq!(q.pop().await, Ok(1));
        assert_eq!(q.pop().await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn drop_where_counts() {
        let q = BoundedQueue::new(8);
        for x in 0..6 {
            assert!(q.try_push(x));
        }
        assert_eq!(q.drop_where(|x| x % 2 == 0), 3);
        assert_eq!(q.len(), 3);
        assert!(q.any_where(|x| *x == 5));
        assert!(q.evict_one_where(|x| *x == 5));
        assert!(!q.any_where(|x| *x == 5));
    }
}
