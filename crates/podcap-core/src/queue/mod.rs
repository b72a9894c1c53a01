//! Deduplicating, rate-limited work queue.
//!
//! A key is queued at most once at a time, and a key being processed is never handed to a
//! second worker: adding it while in flight marks it dirty and it is re-queued on [`WorkQueue::done`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use exponential_backoff::Backoff;
use tokio::{sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::CoreError,
    metrics::{MetricsHandle, SyncOutcome},
};

/// Bounded exponential retry for transient sync failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Requeues allowed before a key is dropped.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that is randomized, in `0.0..=1.0`.
    pub jitter: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    fn schedule(&self) -> Backoff {
        let mut backoff = Backoff::new(u32::MAX, self.base_delay, Some(self.max_delay));
        backoff.set_factor(2);
        backoff.set_jitter(self.jitter);
        backoff
    }

    /// Delay before the requeue that follows `failures` earlier failures, never above
    /// `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        self.schedule()
            .next(failures)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    ready: Notify,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

/// Work queue shared between event handlers (producers) and sync workers (consumers).
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                policy,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: K) {
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Queue `key` once `delay` has elapsed. Pending delayed adds are dropped on shutdown.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Requeue `key` after its per-key exponential backoff.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut st = self.state();
            let failures = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.policy.backoff(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed; re-queue it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            drop(st);
            self.inner.ready.notify_one();
        }
    }

    /// Apply the retry policy to the result of syncing `key` and release it.
    pub fn finish(&self, key: &K, result: Result<(), CoreError>) -> SyncOutcome {
        let outcome = match result {
            Ok(()) => {
                self.forget(key);
                SyncOutcome::Success
            }
            Err(e) if e.is_terminal() => {
                warn!(target: "podcap.core.queue", %key, error = %e, "dropping key after terminal error");
                self.forget(key);
                SyncOutcome::Dropped
            }
            Err(e) => {
                let requeues = self.num_requeues(key);
                if requeues < self.inner.policy.max_retries {
                    debug!(target: "podcap.core.queue", %key, error = %e, requeues, "sync failed; requeueing");
                    self.add_rate_limited(key.clone());
                    SyncOutcome::Retry
                } else {
                    warn!(target: "podcap.core.queue", %key, error = %e, "giving up after {requeues} retries");
                    self.forget(key);
                    SyncOutcome::GivenUp
                }
            }
        };
        self.done(key);
        outcome
    }

    /// Stop accepting keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `workers` consumers of `queue` until `cancel` fires, then shut the queue down and
/// join them. Each key is synced by `sync` and released through [`WorkQueue::finish`].
pub(crate) async fn run_workers<K, F, Fut>(
    queue: WorkQueue<K>,
    workers: usize,
    metrics: MetricsHandle,
    cancel: CancellationToken,
    sync: F,
) where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    F: Fn(K) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<(), CoreError>> + Send,
{
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let queue = queue.clone();
        let metrics = metrics.clone();
        let sync = sync.clone();
        set.spawn(async move {
            debug!(target: "podcap.core.queue", worker, "worker started");
            while let Some(key) = queue.get().await {
                let result = sync(key.clone()).await;
                metrics.sync_finished(queue.finish(&key, result));
            }
            debug!(target: "podcap.core.queue", worker, "worker stopped");
        });
    }

    cancel.cancelled().await;
    info!(target: "podcap.core.queue", "shutting down work queue");
    queue.shut_down();
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(target: "podcap.core.queue", error = %e, "worker task failed");
        }
    }
}
