//! Deduplicating work queue for reconcile keys
//!
//! Keys are handed to at most one worker at a time. A key added while it is
//! queued is merged with the queued entry; a key added while it is being
//! processed is parked and re-queued when the worker calls [`WorkQueue::done`].
//! Failed keys come back through [`WorkQueue::add_rate_limited`] with
//! per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use volley_common::metrics::QUEUE_BACKOFF;

/// First retry delay for a failing key
pub const BACKOFF_BASE: Duration = Duration::from_millis(5);
/// Upper bound on the retry delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// What a reconcile pass asks of the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the key again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Reconcile again only when a new change arrives
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Requested delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Work queue with per-key serialisation and backoff
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    base: Duration,
    max: Duration,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Queue with the default backoff bounds
    pub fn new() -> Self {
        Self::with_backoff(BACKOFF_BASE, BACKOFF_MAX)
    }

    /// Queue with custom backoff bounds
    pub fn with_backoff(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base,
            max,
        }
    }

    /// Mark `key` as needing a pass
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Backoff the next attempt for `key` would get
    pub fn next_backoff(&self, key: &K) -> Duration {
        let failures = self.state.lock().failures.get(key).copied().unwrap_or(0);
        self.backoff_for(failures)
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Add `key` after its current backoff and grow the backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        QUEUE_BACKOFF.record(delay.as_secs_f64(), &[]);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff for `key`
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since the last [`WorkQueue::forget`]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Next key to process; `None` once shut down
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key`; re-queues it when it was added during processing
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let q = WorkQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();

        // re-added while processing: parked, not queued
        q.add("a");
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let q = Arc::new(WorkQueue::new());
        let worker = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a");
        let got = timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_ignores_adds() {
        let q = Arc::new(WorkQueue::<&str>::new());
        let worker = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        let got = timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
        assert_eq!(got, None);

        q.add("a");
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_arrives_after_delay() {
        let q = Arc::new(WorkQueue::new());
        q.add_after("a", Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_backoff_doubles_and_caps() {
        let q = Arc::new(WorkQueue::with_backoff(
            Duration::from_millis(5),
            Duration::from_millis(40),
        ));
        let delays: Vec<Duration> = (0..6).map(|_| q.add_rate_limited("a")).collect();
        assert_eq!(
            delays,
            [5, 10, 20, 40, 40, 40].map(Duration::from_millis).to_vec()
        );
        assert_eq!(q.num_requeues(&"a"), 6);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.next_backoff(&"a"), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn action_carries_requeue_delay() {
        assert_eq!(
            Action::requeue(Duration::from_secs(5)).requeue_after(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(Action::await_change().requeue_after(), None);
    }
}
