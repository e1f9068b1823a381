//! kew work queue: a deduplicating FIFO with per-item retry accounting.
//!
//! Semantics follow the classic controller work queue:
//! - an item already waiting is not queued twice;
//! - an item being processed is not handed to a second worker; re-adding it
//!   marks it dirty and it is queued again once `done` is called;
//! - after `shut_down`, new adds are ignored and `get` returns `None` once
//!   the backlog is empty.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::{debug, trace};

pub mod limiter;

pub use limiter::{default_controller_rate_limiter, ItemExponentialFailure, MaxOf, RateLimiter, TokenBucket, MAX_BUCKET_DELAY};

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    drained: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Cloneable handle to a shared queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T> Inner<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        counter!("kew_queue_adds_total", 1u64, "queue" => self.name.clone());
        if st.processing.contains(&item) {
            trace!(queue = %self.name, item = ?item, "item in flight; marked dirty");
            return;
        }
        st.queue.push_back(item);
        gauge!("kew_queue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        self.ready.notify_one();
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Queue with the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        let inner = Inner {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
            limiter: Box::new(limiter),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Enqueue `item`. Never blocks on consumers.
    pub fn add(&self, item: T) { self.inner.add(item) }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize { self.inner.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }

    /// Wait for the next item. Returns `None` once the queue is shut down and
    /// the backlog is empty. Every `Some` must be paired with [`Self::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("kew_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as finished; re-queues it if it was added while in flight.
    pub fn done(&self, item: &T) {
        let mut st = self.inner.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            self.inner.ready.notify_one();
        }
        if st.shutting_down && st.processing.is_empty() {
            self.inner.drained.notify_waiters();
        }
    }

    /// Re-add after the rate limiter's delay and count one more failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        counter!("kew_queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        self.add_after(item, delay);
    }

    /// Re-add after `delay` unless the queue shuts down first.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        debug!(queue = %self.inner.name, item = ?item, delay_ms = delay.as_millis() as u64, "delayed add");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.add(item);
        });
    }

    /// Drop retry history for `item`.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item) }

    pub fn num_requeues(&self, item: &T) -> usize { self.inner.limiter.num_requeues(item) }

    /// Stop accepting work and wake every waiting `get`.
    pub fn shut_down(&self) {
        let mut st = self.inner.lock();
        if !st.shutting_down {
            debug!(queue = %self.inner.name, "queue shutting down");
        }
        st.shutting_down = true;
        self.inner.ready.notify_waiters();
        if st.processing.is_empty() {
            self.inner.drained.notify_waiters();
        }
    }

    /// Shut down, then wait until every in-flight item has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedups_waiting_items() {
        let q: WorkQueue<&str> = WorkQueue::new("t");
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn in_flight_item_requeued_on_done() {
        let q: WorkQueue<&str> = WorkQueue::new("t");
        q.add("a");
        let a = q.get().await.unwrap();
        q.add("a");
        assert!(q.is_empty(), "in-flight item must not be handed out twice");
        q.done(&a);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }
}
