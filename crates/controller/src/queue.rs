//! Deduplicating per-key work queue with bounded exponential retry.
//!
//! A key can be pending, in flight, or dirty (re-added while in flight).
//! At most one reconcile per key runs at any time; a change arriving during
//! processing schedules exactly one follow-up pass instead of being
//! dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// Unit of work: a workload key plus, for deletions no longer readable
/// from the cache, the last observed snapshot.
#[derive(Debug)]
pub struct WorkItem<T> {
    /// `namespace/name` of the workload.
    pub key: String,
    pub tombstone: Option<Arc<T>>,
}

impl<T> WorkItem<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tombstone: None,
        }
    }

    pub fn tombstone(key: impl Into<String>, snapshot: Arc<T>) -> Self {
        Self {
            key: key.into(),
            tombstone: Some(snapshot),
        }
    }
}

impl<T> Clone for WorkItem<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            tombstone: self.tombstone.clone(),
        }
    }
}

/// Backoff applied to retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            max_retries: 15,
        }
    }
}

impl RetryPolicy {
    /// Reads overrides from `KRILL_RETRY_BASE_MS`, `KRILL_RETRY_MAX_SECS`
    /// and `KRILL_MAX_RETRIES`.
    pub fn from_env() -> Self {
        let mut p = Self::default();
        if let Some(ms) = std::env::var("KRILL_RETRY_BASE_MS").ok().and_then(|s| s.parse().ok()) {
            p.base = Duration::from_millis(ms);
        }
        if let Some(s) = std::env::var("KRILL_RETRY_MAX_SECS").ok().and_then(|s| s.parse().ok()) {
            p.max = Duration::from_secs(s);
        }
        if let Some(n) = std::env::var("KRILL_MAX_RETRIES").ok().and_then(|s| s.parse().ok()) {
            p.max_retries = n;
        }
        p
    }

    /// Delay before the `retries`-th re-add: `base * 2^retries`, capped.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 2u32.checked_pow(retries.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
    }
}

struct Inner<T> {
    pending: VecDeque<String>,
    items: FxHashMap<String, WorkItem<T>>,
    active: FxHashSet<String>,
    dirty: FxHashMap<String, WorkItem<T>>,
    retries: FxHashMap<String, u32>,
    shutting_down: bool,
}

/// The shared queue. Watch dispatchers add, workers pop/done, the retry
/// path re-adds after a delay.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    policy: RetryPolicy,
}

impl<T: Send + Sync + 'static> WorkQueue<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                items: FxHashMap::default(),
                active: FxHashSet::default(),
                dirty: FxHashMap::default(),
                retries: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("work queue lock poisoned")
    }

    /// Adds an item. A key already pending is coalesced (latest payload
    /// wins); a key currently in flight is marked dirty for a follow-up
    /// pass. No-op after shutdown.
    pub fn add(&self, item: WorkItem<T>) {
        let mut q = self.lock();
        if q.shutting_down {
            return;
        }
        let key = item.key.clone();
        if q.active.contains(&key) {
            q.dirty.insert(key, item);
            return;
        }
        if q.items.insert(key.clone(), item).is_none() {
            q.pending.push_back(key);
        }
        drop(q);
        counter!("queue_adds", 1u64);
        self.notify.notify_one();
    }

    /// Pops the next item, marking its key in flight. Blocks while the
    /// queue is empty; returns `None` once shut down and drained.
    pub async fn pop(&self) -> Option<WorkItem<T>> {
        loop {
            {
                let mut q = self.lock();
                if let Some(key) = q.pending.pop_front() {
                    if let Some(item) = q.items.remove(&key) {
                        q.active.insert(key);
                        return Some(item);
                    }
                    continue;
                }
                if q.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a pass over `key` finished. A dirty re-add moves back to
    /// pending, keeping the one-in-flight-per-key guarantee.
    pub fn done(&self, key: &str) {
        let mut q = self.lock();
        q.active.remove(key);
        if let Some(item) = q.dirty.remove(key) {
            if !q.shutting_down {
                q.items.insert(key.to_string(), item);
                q.pending.push_back(key.to_string());
                drop(q);
                self.notify.notify_one();
            }
        }
    }

    /// Clears the retry counter for `key` (successful pass or terminal
    /// validation failure).
    pub fn forget(&self, key: &str) {
        self.lock().retries.remove(key);
    }

    /// Schedules `item` for a delayed re-add with exponential backoff.
    /// Returns false when the retry budget is exhausted; the item is then
    /// dropped and the caller is expected to surface the failure.
    pub fn retry(self: &Arc<Self>, item: WorkItem<T>) -> bool {
        let (attempt, delay) = {
            let mut q = self.lock();
            if q.shutting_down {
                return true;
            }
            let attempt = *q
                .retries
                .entry(item.key.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            if attempt > self.policy.max_retries {
                q.retries.remove(&item.key);
                drop(q);
                counter!("queue_retries_exhausted", 1u64);
                return false;
            }
            (attempt, self.policy.delay(attempt - 1))
        };
        debug!(key = %item.key, attempt, delay_ms = delay.as_millis() as u64, "requeueing with backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
        true
    }

    /// Stops accepting new items and wakes all waiting workers; items
    /// already pending are still handed out so in-flight work can finish.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn q() -> Arc<WorkQueue<()>> {
        Arc::new(WorkQueue::new(RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(20),
            max_retries: 3,
        }))
    }

    #[tokio::test]
    async fn pending_keys_are_deduplicated() {
        let q = q();
        q.add(WorkItem::new("foo/bar"));
        q.add(WorkItem::new("foo/bar"));
        q.add(WorkItem::new("foo/baz"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await.unwrap().key, "foo/bar");
        assert_eq!(q.pop().await.unwrap().key, "foo/baz");
    }

    #[tokio::test]
    async fn re_add_during_processing_marks_dirty_for_one_follow_up() {
        let q = q();
        q.add(WorkItem::new("foo/bar"));
        let item = q.pop().await.unwrap();
        // Changes arriving while the key is in flight must not be lost,
        // but also must not run concurrently.
        q.add(WorkItem::new("foo/bar"));
        q.add(WorkItem::new("foo/bar"));
        assert_eq!(q.len(), 0);
        q.done(&item.key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().await.unwrap().key, "foo/bar");
        q.done("foo/bar");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn tombstones_ride_along_with_items() {
        let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new(RetryPolicy::default()));
        q.add(WorkItem::tombstone("foo/bar", Arc::new("snapshot".to_string())));
        let item = q.pop().await.unwrap();
        assert_eq!(item.tombstone.as_deref(), Some(&"snapshot".to_string()));
    }

    #[tokio::test]
    async fn retry_re_adds_until_the_budget_is_exhausted() {
        let q = q();
        assert!(q.retry(WorkItem::new("foo/bar")));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.len(), 1);
        let item = q.pop().await.unwrap();
        q.done(&item.key);
        assert!(q.retry(item.clone()));
        assert!(q.retry(item.clone()));
        // Fourth failure exceeds max_retries=3.
        assert!(!q.retry(item));
    }

    #[tokio::test]
    async fn forget_resets_the_retry_counter() {
        let q = q();
        let item = WorkItem::<()>::new("foo/bar");
        assert!(q.retry(item.clone()));
        assert!(q.retry(item.clone()));
        q.forget("foo/bar");
        assert!(q.retry(item.clone()));
        assert!(q.retry(item.clone()));
        assert!(q.retry(item.clone()));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_then_releases_workers() {
        let q = q();
        q.add(WorkItem::new("foo/bar"));
        q.shut_down();
        q.add(WorkItem::new("foo/baz"));
        assert_eq!(q.pop().await.unwrap().key, "foo/bar");
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_wakes_a_blocked_worker() {
        let q = q();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker did not wake")
            .unwrap();
        assert!(popped.is_none());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(40),
            max_retries: 10,
        };
        assert_eq!(p.delay(0), Duration::from_millis(5));
        assert_eq!(p.delay(1), Duration::from_millis(10));
        assert_eq!(p.delay(2), Duration::from_millis(20));
        assert_eq!(p.delay(3), Duration::from_millis(40));
        assert_eq!(p.delay(9), Duration::from_millis(40));
    }
}
