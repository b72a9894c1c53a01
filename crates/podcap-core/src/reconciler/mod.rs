//! Selector-driven reconciler.
//!
//! One sync cycle brings the live captures of a job in line with the pods its selector
//! matches on this node, then derives the job phase from what is actually running:
//!
//! ```text
//! cluster event ─► job key ─► WorkQueue ─► sync(job)
//!                                           ├─ stop captures of pods no longer desired
//!                                           ├─ start captures of newly desired pods
//!                                           └─ derive phase ─► StatusSynchronizer
//! ```
//!
//! Timed captures are stopped by a per-capture timer; when the last capture of a job
//! expires the job moves to `Completed`, which is terminal.

mod policy;
pub use policy::{ContainerPolicy, FirstContainer};

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use podcap_model::{CaptureJob, JobKey, JobStatus, Phase, PodIdentity, PodKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{CaptureBackend, CaptureId, CaptureRecord, CaptureRequest, StopMode},
    cluster::{Change, ClusterCache, ClusterEvent, EventHandler, StatusClient, wait_for_cache_sync},
    error::{CaptureError, CoreError},
    metrics::{MetricsHandle, NoOpMetrics},
    queue::{RetryPolicy, WorkQueue, run_workers},
    status::{StatusBackoff, StatusSynchronizer},
};

const MSG_NO_MATCHING_PODS: &str = "No matching pods on this node";
const MSG_WAITING: &str = "Waiting for capture to start";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub node_name: String,
    /// Rotated output files per capture.
    pub max_files: u32,
    /// Delay before a job is retried after admission was exhausted.
    pub at_capacity_delay: Duration,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub status_backoff: StatusBackoff,
}

impl ReconcilerConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            max_files: 3,
            at_capacity_delay: Duration::from_secs(2),
            workers: 2,
            retry: RetryPolicy::default(),
            status_backoff: StatusBackoff::default(),
        }
    }
}

/// Jobs and pods whose captures ran out their timeout.
///
/// Kept so that a job reaching `Completed` is never restarted, even before the status write
/// is visible in the cache, and so that expired pods of a partially finished job stay stopped.
#[derive(Default)]
struct Ledger {
    completed: HashSet<JobKey>,
    expired: HashMap<JobKey, HashSet<PodKey>>,
}

struct Inner {
    cfg: ReconcilerConfig,
    cache: Arc<dyn ClusterCache>,
    backend: Arc<dyn CaptureBackend>,
    status: StatusSynchronizer,
    policy: Arc<dyn ContainerPolicy>,
    metrics: MetricsHandle,
    queue: WorkQueue<JobKey>,
    ledger: Mutex<Ledger>,
}

pub struct ReconcilerBuilder {
    cfg: ReconcilerConfig,
    cache: Arc<dyn ClusterCache>,
    status: Arc<dyn StatusClient>,
    backend: Arc<dyn CaptureBackend>,
    policy: Arc<dyn ContainerPolicy>,
    metrics: MetricsHandle,
}

impl ReconcilerBuilder {
    pub fn container_policy(mut self, policy: Arc<dyn ContainerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Reconciler {
        let status = StatusSynchronizer::new(self.status, self.cfg.node_name.as_str())
            .with_backoff(self.cfg.status_backoff);
        let queue = WorkQueue::new(self.cfg.retry);
        Reconciler {
            inner: Arc::new(Inner {
                cfg: self.cfg,
                cache: self.cache,
                backend: self.backend,
                status,
                policy: self.policy,
                metrics: self.metrics,
                queue,
                ledger: Mutex::new(Ledger::default()),
            }),
        }
    }
}

/// Reconciles capture jobs against the live captures of this node.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn builder(
        cfg: ReconcilerConfig,
        cache: Arc<dyn ClusterCache>,
        status: Arc<dyn StatusClient>,
        backend: Arc<dyn CaptureBackend>,
    ) -> ReconcilerBuilder {
        ReconcilerBuilder {
            cfg,
            cache,
            status,
            backend,
            policy: Arc::new(FirstContainer),
            metrics: NoOpMetrics::handle(),
        }
    }

    pub fn queue(&self) -> &WorkQueue<JobKey> {
        &self.inner.queue
    }

    fn node(&self) -> &str {
        &self.inner.cfg.node_name
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn forget_job(&self, key: &JobKey) {
        let mut ledger = self.ledger();
        ledger.completed.remove(key);
        ledger.expired.remove(key);
    }

    fn is_completed(&self, key: &JobKey) -> bool {
        self.ledger().completed.contains(key)
    }

    fn is_expired(&self, key: &JobKey, pod: &PodKey) -> bool {
        self.ledger()
            .expired
            .get(key)
            .is_some_and(|pods| pods.contains(pod))
    }

    fn unmark_expired(&self, key: &JobKey, pod: &PodKey) {
        let mut ledger = self.ledger();
        if let Some(pods) = ledger.expired.get_mut(key) {
            pods.remove(pod);
            if pods.is_empty() {
                ledger.expired.remove(key);
            }
        }
    }

    /// Wait for the cache, enqueue every known job and process the queue until `cancel`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CoreError> {
        wait_for_cache_sync(self.inner.cache.as_ref(), &cancel).await?;
        info!(target: "podcap.core.reconciler", node = %self.node(), "caches synced; starting workers");

        for job in self.inner.cache.jobs() {
            self.inner.queue.add(job.key);
        }

        let this = self.clone();
        let worker_cancel = cancel.clone();
        run_workers(
            self.inner.queue.clone(),
            self.inner.cfg.workers,
            self.inner.metrics.clone(),
            cancel,
            move |key: JobKey| {
                let this = this.clone();
                let cancel = worker_cancel.clone();
                async move { this.sync(&key, &cancel).await }
            },
        )
        .await;
        Ok(())
    }

    /// One reconciliation cycle for `key`.
    #[instrument(skip_all, fields(job = %key))]
    pub async fn sync(&self, key: &JobKey, cancel: &CancellationToken) -> Result<(), CoreError> {
        let Some(job) = self.inner.cache.job(key) else {
            self.teardown(key).await;
            return Ok(());
        };
        if job.status.is_phase(Phase::Completed) || self.is_completed(key) {
            debug!(target: "podcap.core.reconciler", "job completed; nothing to do");
            return Ok(());
        }

        let selector = match job.spec.pod_selector.compile() {
            Ok(selector) => selector,
            Err(e) => {
                warn!(target: "podcap.core.reconciler", error = %e, "invalid pod selector");
                let failed =
                    JobStatus::new(Phase::Failed).with_message(format!("Invalid podSelector: {e}"));
                self.inner
                    .status
                    .ensure_status(&job, failed)
                    .await
                    .map_err(|e| CoreError::status(key, e))?;
                return Ok(());
            }
        };

        let desired: Vec<PodIdentity> = self
            .inner
            .cache
            .pods(job.namespace())
            .into_iter()
            .filter(|pod| pod.is_on_node(self.node()) && selector.matches(&pod.labels))
            .collect();
        let wanted: HashSet<PodKey> = desired.iter().map(PodIdentity::key).collect();

        for record in self.inner.backend.captures_for_job(key) {
            if !wanted.contains(&record.pod) {
                info!(target: "podcap.core.reconciler", pod = %record.pod, "pod no longer matches; stopping capture");
                self.inner.backend.stop(&record.pod, StopMode::Discard).await;
            }
        }

        for pod in &desired {
            if self.is_completed(key) || !self.ensure_capture(&job, pod, cancel).await? {
                break;
            }
        }

        // A timer may have completed the job while this cycle was starting captures.
        if self.is_completed(key) {
            let late = self.inner.backend.captures_for_job(key);
            if !late.is_empty() {
                info!(target: "podcap.core.reconciler", captures = late.len(), "job completed during sync; stopping late captures");
            }
            self.stop_all(key, StopMode::Retain).await;
            return Ok(());
        }

        let desired_status = self.derive_status(&job, desired.is_empty());
        if let Some(status) = desired_status {
            self.inner
                .status
                .ensure_status(&job, status)
                .await
                .map_err(|e| CoreError::status(key, e))?;
        }
        Ok(())
    }

    /// Start a capture of `pod` for `job` if one is needed. Returns `false` when admission is
    /// exhausted and the rest of the cycle should be skipped.
    async fn ensure_capture(
        &self,
        job: &CaptureJob,
        pod: &PodIdentity,
        cancel: &CancellationToken,
    ) -> Result<bool, CoreError> {
        let pod_key = pod.key();
        if let Some(existing) = self.inner.backend.capture(&pod_key) {
            if existing.job != job.key {
                debug!(target: "podcap.core.reconciler", pod = %pod_key, owner = %existing.job, "pod already captured by another job");
            }
            return Ok(true);
        }
        if self.is_expired(&job.key, &pod_key) {
            return Ok(true);
        }
        let Some(container) = self.inner.policy.select(pod) else {
            warn!(target: "podcap.core.reconciler", pod = %pod_key, "no container id yet; skipping pod");
            return Ok(true);
        };

        let req = CaptureRequest {
            pod: pod_key.clone(),
            job: job.key.clone(),
            container,
            max_files: self.inner.cfg.max_files,
            timeout: job.spec.timeout(),
        };
        match self.inner.backend.start(req, cancel).await {
            Ok(record) => {
                info!(target: "podcap.core.reconciler", pod = %pod_key, id = %record.id, file = %record.file_location, "capture started");
                if let Some(timeout) = record.timeout {
                    self.arm_timer(&record, timeout);
                }
                Ok(true)
            }
            Err(CaptureError::AtCapacity) => {
                info!(target: "podcap.core.reconciler", pod = %pod_key, "max concurrent captures reached; rescheduling job");
                self.inner
                    .queue
                    .add_after(job.key.clone(), self.inner.cfg.at_capacity_delay);
                Ok(false)
            }
            Err(CaptureError::AlreadyRunning(_)) => {
                debug!(target: "podcap.core.reconciler", pod = %pod_key, "pod captured concurrently; skipping");
                Ok(true)
            }
            Err(CaptureError::InvalidContainer(e)) => {
                warn!(target: "podcap.core.reconciler", pod = %pod_key, error = %e, "unusable container id; skipping pod");
                Ok(true)
            }
            Err(e) => Err(CoreError::capture(&pod_key, e)),
        }
    }

    fn derive_status(&self, job: &CaptureJob, no_pods: bool) -> Option<JobStatus> {
        let current = &job.status;
        if no_pods {
            let settled = current.is_phase(Phase::Running)
                || current.is_phase(Phase::Completed)
                || current.is_owned_by_other(self.node());
            return (!settled).then(|| JobStatus::new(Phase::Pending).with_message(MSG_NO_MATCHING_PODS));
        }

        let active = self.inner.backend.captures_for_job(&job.key);
        if let Some(location) = self.inner.backend.latest_artifact(&active) {
            return Some(
                JobStatus::new(Phase::Running)
                    .with_file_location(location)
                    .with_owner(self.node()),
            );
        }
        if current.is_phase(Phase::Completed) {
            return None;
        }
        Some(
            JobStatus::new(Phase::Pending)
                .with_message(MSG_WAITING)
                .with_owner(self.node()),
        )
    }

    async fn stop_all(&self, key: &JobKey, mode: StopMode) {
        for record in self.inner.backend.captures_for_job(key) {
            self.inner.backend.stop(&record.pod, mode).await;
        }
    }

    async fn teardown(&self, key: &JobKey) {
        let live = self.inner.backend.captures_for_job(key);
        if !live.is_empty() {
            info!(target: "podcap.core.reconciler", job = %key, captures = live.len(), "job deleted; stopping captures");
        }
        self.stop_all(key, StopMode::Discard).await;
        self.inner.backend.cleanup_job_artifacts(key);
        self.forget_job(key);
    }

    fn arm_timer(&self, record: &CaptureRecord, timeout: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let (job, pod, id) = (record.job.clone(), record.pod.clone(), record.id);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Reconciler { inner }.expire(&job, &pod, id, timeout).await;
            }
        });
        if !self
            .inner
            .backend
            .attach_timer(&record.pod, record.id, timer.abort_handle())
        {
            timer.abort();
        }
    }

    async fn expire(&self, job: &JobKey, pod: &PodKey, id: CaptureId, timeout: Duration) {
        // Marked before the record goes away so a concurrent sync never restarts the pod.
        let newly_marked = self
            .ledger()
            .expired
            .entry(job.clone())
            .or_default()
            .insert(pod.clone());
        let Some(record) = self.inner.backend.stop_expired(pod, id).await else {
            if newly_marked {
                self.unmark_expired(job, pod);
            }
            return;
        };
        info!(target: "podcap.core.reconciler", %job, %pod, "capture timed out");

        if !self.inner.backend.captures_for_job(job).is_empty() {
            return;
        }
        self.ledger().completed.insert(job.clone());

        let location = self
            .inner
            .backend
            .latest_artifact(std::slice::from_ref(&record))
            .unwrap_or(record.file_location);
        let completed = JobStatus::new(Phase::Completed)
            .with_message(format!("Capture timed out after {}", human_duration(timeout)))
            .with_file_location(location)
            .with_owner(self.node());
        if let Err(e) = self.inner.status.update_status(job, completed).await {
            warn!(target: "podcap.core.reconciler", %job, error = %e, "failed to record completion");
        }
    }

    /// Jobs whose selector matches any of `pods`.
    fn jobs_selecting(&self, pods: &[&PodIdentity]) -> BTreeSet<JobKey> {
        let mut keys = BTreeSet::new();
        for job in self.inner.cache.jobs() {
            let candidates: Vec<_> = pods
                .iter()
                .filter(|pod| pod.namespace == job.namespace())
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let Ok(selector) = job.spec.pod_selector.compile() else {
                continue;
            };
            if candidates.iter().any(|pod| selector.matches(&pod.labels)) {
                keys.insert(job.key);
            }
        }
        keys
    }
}

impl EventHandler for Reconciler {
    fn on_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::Pod(change) => {
                let local: Vec<&PodIdentity> = change
                    .objects()
                    .filter(|pod| pod.is_on_node(self.node()))
                    .collect();
                if local.is_empty() {
                    return;
                }

                let mut keys = self.jobs_selecting(&local);
                for pod in &local {
                    if let Some(record) = self.inner.backend.capture(&pod.key()) {
                        keys.insert(record.job);
                    }
                }
                for key in keys {
                    self.inner.queue.add(key);
                }
            }
            ClusterEvent::Job(change) => {
                if let Change::Deleted(job) = change {
                    self.forget_job(&job.key);
                }
                let keys: BTreeSet<JobKey> = change.objects().map(|job| job.key.clone()).collect();
                for key in keys {
                    self.inner.queue.add(key);
                }
            }
        }
    }
}

/// Compact duration rendering (`500ms`, `2s`, `1m30s`, `1h0m5s`).
fn human_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        return format!("{ms}ms");
    }
    let (h, m) = (ms / 3_600_000, (ms / 60_000) % 60);
    let rem_ms = ms % 60_000;
    let secs = if rem_ms % 1000 == 0 {
        format!("{}", rem_ms / 1000)
    } else {
        let s = format!("{}.{:03}", rem_ms / 1000, rem_ms % 1000);
        s.trim_end_matches('0').to_string()
    };
    match (h, m) {
        (0, 0) => format!("{secs}s"),
        (0, m) => format!("{m}m{secs}s"),
        (h, m) => format!("{h}h{m}m{secs}s"),
    }
}
