//! Rate-limited work queue
//!
//! FIFO with two sets:
//! - `dirty`: items waiting to be processed (dedups repeated adds)
//! - `processing`: items handed to a worker and not yet `done`
//!
//! An item is never handed to two workers at once. Adding an item that is being
//! processed marks it dirty; `done` puts it back on the queue.

use crate::apis::metrics;
use crate::controller::rate_limiter::RateLimiter;
use crate::sync::safe_lock;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    limiter: RateLimiter<T>,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RateLimiter::default())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: RateLimiter<T>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter,
        }
    }

    pub fn add(&self, item: T) {
        let mut state = safe_lock(&self.state);
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        metrics::set_workqueue_depth(state.queue.len());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its rate-limited delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        debug!("Work queue: requeue in {:?}", delay);
        self.add_after(item, delay);
    }

    /// Stop tracking failures for `item`
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = safe_lock(&self.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    metrics::set_workqueue_depth(state.queue.len());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as processed, requeueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = safe_lock(&self.state);
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            metrics::set_workqueue_depth(state.queue.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        safe_lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        safe_lock(&self.state).shutting_down
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
