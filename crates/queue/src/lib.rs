//! Meridian work queue: a deduplicating, rate-limited FIFO of keys.
//!
//! A key is in one of three places: `queue` (pending, in order), `processing`
//! (handed to a worker by [`WorkQueue::get`]) or nowhere. `dirty` tracks every
//! key that needs another pass; a key added while it is processing stays dirty
//! and goes back to the queue on [`WorkQueue::done`]. No key is ever handed to
//! two workers at once, and no add is lost.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod rate_limiter;

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOf,
    RateLimiter,
};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A key parked until `ready_at`. Heap order is earliest first.
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    /// Keys currently held by a worker, with the time they were handed out.
    processing: FxHashMap<K, Instant>,
    waiting: BinaryHeap<Waiting<K>>,
    /// Authoritative ready time per waiting key; heap entries that disagree are stale.
    waiting_at: FxHashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashMap::default(),
            waiting: BinaryHeap::new(),
            waiting_at: FxHashMap::default(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key became newly dirty.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if !self.processing.contains_key(&key) {
            self.queue.push_back(key);
        }
        true
    }

    fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.dirty.remove(&key);
        self.processing.insert(key.clone(), Instant::now());
        Some(key)
    }

    fn promote_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = self.waiting.pop() else { break };
            if self.waiting_at.get(&w.key) == Some(&w.ready_at) {
                self.waiting_at.remove(&w.key);
                self.insert(w.key);
            }
        }
    }

    fn next_ready(&self) -> Option<Instant> { self.waiting.peek().map(|w| w.ready_at) }
}

/// Thread-safe work queue shared by producers (event handlers) and workers.
pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Queue backed by [`default_controller_rate_limiter`].
    pub fn new(name: &'static str) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(name: &'static str, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self { name, state: Mutex::new(State::new()), notify: Notify::new(), limiter: Box::new(limiter) }
    }

    pub fn name(&self) -> &'static str { self.name }

    /// Mark `key` as needing processing. Idempotent while the key is pending;
    /// while it is processing, the key is requeued once `done` is called.
    pub fn add(&self, key: K) {
        let depth = {
            let mut st = lock(&self.state);
            if st.shutting_down {
                trace!(queue = self.name, key = ?key, "add ignored: shutting down");
                return;
            }
            if !st.insert(key) {
                return;
            }
            st.queue.len()
        };
        counter!("workqueue_adds_total", 1u64, "queue" => self.name);
        gauge!("workqueue_depth", depth as f64, "queue" => self.name);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. A key already waiting keeps its earlier ready time.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let ready_at = Instant::now() + delay;
        {
            let mut st = lock(&self.state);
            if st.shutting_down {
                return;
            }
            if st.waiting_at.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            st.waiting_at.insert(key.clone(), ready_at);
            st.seq += 1;
            let seq = st.seq;
            st.waiting.push(Waiting { ready_at, seq, key });
        }
        // A parked getter may need an earlier wake-up.
        self.notify.notify_one();
    }

    /// Add `key` after the delay chosen by the rate limiter. Counts as one requeue.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64, "queue" => self.name);
        debug!(queue = self.name, key = ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the requeue counter for `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key) }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Wait for the next pending key and mark it processing.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut st = lock(&self.state);
                st.promote_due(Instant::now());
                if let Some(key) = st.pop() {
                    let depth = st.queue.len();
                    drop(st);
                    gauge!("workqueue_depth", depth as f64, "queue" => self.name);
                    if depth > 0 {
                        // Pass the wake-up on so other parked workers see the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_ready()
            };

            match next_ready {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `key`. If it was added meanwhile, it becomes pending again.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = lock(&self.state);
            if let Some(started) = st.processing.remove(key) {
                histogram!("workqueue_work_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "queue" => self.name);
            }
            if st.dirty.contains(key) {
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting adds and release every parked `get` once pending keys are drained.
    /// Keys still waiting on a delay are dropped.
    pub fn shut_down(&self) {
        {
            let mut st = lock(&self.state);
            st.shutting_down = true;
            st.waiting.clear();
            st.waiting_at.clear();
        }
        debug!(queue = self.name, "queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { lock(&self.state).shutting_down }

    /// Number of pending keys (excludes processing and delayed keys).
    pub fn len(&self) -> usize { lock(&self.state).queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::with_rate_limiter("test", ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn repeated_adds_collapse_while_pending() {
        let q = queue();
        q.add("a".into());
        q.add("a".into());
        q.add("b".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_during_processing_redelivers_once_after_done() {
        let q = queue();
        q.add("k".into());
        let k = q.get().await.unwrap();

        q.add("k".into());
        q.add("k".into());
        assert_eq!(q.len(), 0, "processing key must not be pending");
        assert!(tokio::time::timeout(Duration::from_secs(1), q.get()).await.is_err());

        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("k"));
        q.done(&k);
        assert!(tokio::time::timeout(Duration::from_secs(1), q.get()).await.is_err());
    }

    #[tokio::test]
    async fn done_without_new_add_forgets_key() {
        let q = queue();
        q.add("k".into());
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
        q.add("k".into());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let q = queue();
        q.add("a".into());
        q.shut_down();
        q.add("b".into());
        assert!(q.is_shutting_down());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_delayed_keys() {
        let q = queue();
        q.add_after("late".into(), Duration::from_secs(5));
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_counts_requeues_and_forget_resets() {
        let q = queue();
        q.add_rate_limited("k".into());
        q.add_rate_limited("k".into());
        assert_eq!(q.num_requeues(&"k".to_string()), 2);
        q.forget(&"k".to_string());
        assert_eq!(q.num_requeues(&"k".to_string()), 0);
    }
}
