//! Deduplicating, rate-limited work queue.
//!
//! A pending key is queued at most once. A key added while a worker holds it
//! is marked dirty and queued again when the worker calls [`WorkQueue::done`],
//! so the same key is never handed to two workers at the same time.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::trace;

/// Per-key exponential backoff: `base * 2^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(300))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    failures: FxHashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    backoff: Backoff,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            failures: FxHashMap::default(),
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { state: Mutex::new(state), notify: Notify::new(), backoff }) }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless it is already pending. Returns `false` once the
    /// queue is shutting down.
    pub fn add(&self, item: T) -> bool {
        let mut st = self.lock();
        if st.shutting_down {
            return false;
        }
        if !st.dirty.insert(item.clone()) {
            return true;
        }
        if st.processing.contains(&item) {
            trace!("item in flight; marked dirty");
            return true;
        }
        st.queue.push_back(item);
        drop(st);
        self.inner.notify.notify_one();
        true
    }

    /// Wait for the next item. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing; re-queues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Re-queue after the backoff for this item's failure count, then bump
    /// the count.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(item.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further adds and wake every waiter.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}
