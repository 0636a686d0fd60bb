//! Tender work queue: coalescing reconcile keys with delayed and rate-limited adds.
//!
//! The queue is a set: adding a key that is already pending is a no-op. A key is
//! handed to at most one worker at a time; adds that arrive while it is being
//! processed are recorded and released again by [`WorkQueue::done`].

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Longest delay honoured by [`WorkQueue::add_after`]; longer ones are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(300))
    }
}

struct Inner<K> {
    /// Keys ready to hand out, in arrival order. Never holds a key that is processing.
    ready: VecDeque<K>,
    /// Keys that need processing (ready or parked behind an in-flight run).
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    /// Delayed keys and the instant they become ready (earliest wins).
    waiting: FxHashMap<K, Instant>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            failures: FxHashMap::default(),
            shutting_down: false,
        }
    }

    /// Mark a key dirty; returns true when it became visible to workers.
    fn insert(&mut self, key: K) -> bool {
        if !self.dirty.insert(key.clone()) {
            counter!("queue_coalesced", 1u64);
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        if self.waiting.is_empty() {
            return;
        }
        let due: Vec<K> = self.waiting.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
        for key in due {
            self.waiting.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

/// Deduplicating, rate-limited queue of keys shared by producers and workers.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    pub fn new(backoff: Backoff) -> Self {
        Self { inner: Mutex::new(Inner::new()), notify: Notify::new(), backoff }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a key ready now. No-op if it is already pending.
    pub fn add(&self, key: K) {
        let visible = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            counter!("queue_adds", 1u64);
            let visible = inner.insert(key);
            gauge!("queue_depth", inner.ready.len() as f64);
            visible
        };
        if visible {
            self.notify.notify_one();
        }
    }

    /// Make a key ready after `delay` (at most [`MAX_DELAY`]). Until then it is invisible to workers.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let at = Instant::now() + delay.min(MAX_DELAY);
            let slot = inner.waiting.entry(key).or_insert(at);
            if at < *slot {
                *slot = at;
            }
        }
        // Sleeping workers may hold a later deadline; let them recompute.
        self.notify.notify_waiters();
    }

    /// Re-add a key after a failure, delayed by its per-key backoff.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut inner = self.lock();
            let n = inner.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            self.backoff.delay(*n)
        };
        counter!("queue_retries", 1u64);
        trace!(delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the failure counter of a key.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Failures recorded for a key since its last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next ready key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                inner.promote_due(Instant::now());
                if let Some(key) = inner.ready.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    gauge!("queue_depth", inner.ready.len() as f64);
                    return Some(key);
                }
                inner.next_deadline()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key taken with `get`. A key re-added meanwhile becomes ready again.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut inner = self.lock();
            inner.processing.remove(key);
            if inner.dirty.contains(key) && !inner.shutting_down {
                inner.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys parked behind a delay.
    pub fn delayed(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Stop handing out keys and wake every waiting worker. Pending keys are dropped.
    pub fn shut_down(&self) {
        {
            let mut inner = self.lock();
            inner.shutting_down = true;
            debug!(ready = inner.ready.len(), delayed = inner.waiting.len(), "work queue shutting down");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

impl<K: Clone + Eq + Hash + Send> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}
