//! In-memory cluster used by tests and local runs.
//!
//! Behaves like a synced informer cache plus a status endpoint: every mutation bumps a
//! global resource version and emits a [`ClusterEvent`] to each subscriber, and status
//! writes carrying a stale version are rejected with [`StatusError::Conflict`].
//! [`MemoryBackend`] stands in for the process supervisor without spawning anything.

mod backend;
pub use backend::MemoryBackend;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use podcap_model::{CaptureJob, JobKey, JobStatus, PodIdentity, PodKey};
use tokio::sync::mpsc;

use crate::{
    cluster::{Change, ClusterCache, ClusterEvent, StatusClient},
    error::StatusError,
};

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobKey, CaptureJob>,
    pods: BTreeMap<PodKey, PodIdentity>,
    version: u64,
    synced: bool,
    pending_conflicts: u32,
    status_writes: u64,
    subscribers: Vec<mpsc::UnboundedSender<ClusterEvent>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn emit(&mut self, event: ClusterEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<State>>,
}

impl MemoryCluster {
    /// Empty cluster whose cache reports itself synced.
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.set_synced(true);
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_synced(&self, synced: bool) {
        self.state().synced = synced;
    }

    /// Receive every change made after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }

    /// Create or replace a job's spec. An existing status is kept, like a spec-only update.
    pub fn apply_job(&self, mut job: CaptureJob) -> CaptureJob {
        let mut st = self.state();
        job.resource_version = st.next_version();
        let old = st.jobs.get(&job.key).cloned();
        if let Some(old) = &old {
            job.status = old.status.clone();
        }
        st.jobs.insert(job.key.clone(), job.clone());

        let change = match old {
            Some(old) => Change::Updated {
                old,
                new: job.clone(),
            },
            None => Change::Added(job.clone()),
        };
        st.emit(ClusterEvent::Job(change));
        job
    }

    pub fn delete_job(&self, key: &JobKey) -> Option<CaptureJob> {
        let mut st = self.state();
        let job = st.jobs.remove(key)?;
        st.next_version();
        st.emit(ClusterEvent::Job(Change::Deleted(job.clone())));
        Some(job)
    }

    pub fn apply_pod(&self, pod: PodIdentity) {
        let mut st = self.state();
        st.next_version();
        let change = match st.pods.insert(pod.key(), pod.clone()) {
            Some(old) => Change::Updated { old, new: pod },
            None => Change::Added(pod),
        };
        st.emit(ClusterEvent::Pod(change));
    }

    pub fn delete_pod(&self, key: &PodKey) -> Option<PodIdentity> {
        let mut st = self.state();
        let pod = st.pods.remove(key)?;
        st.next_version();
        st.emit(ClusterEvent::Pod(Change::Deleted(pod.clone())));
        Some(pod)
    }

    /// Make the next `n` status writes fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state().pending_conflicts = n;
    }

    /// Number of status writes that were accepted.
    pub fn status_writes(&self) -> u64 {
        self.state().status_writes
    }

    pub fn status(&self, key: &JobKey) -> Option<JobStatus> {
        self.state().jobs.get(key).map(|job| job.status.clone())
    }
}

impl ClusterCache for MemoryCluster {
    fn has_synced(&self) -> bool {
        self.state().synced
    }

    fn job(&self, key: &JobKey) -> Option<CaptureJob> {
        self.state().jobs.get(key).cloned()
    }

    fn jobs(&self) -> Vec<CaptureJob> {
        self.state().jobs.values().cloned().collect()
    }

    fn pod(&self, key: &PodKey) -> Option<PodIdentity> {
        self.state().pods.get(key).cloned()
    }

    fn pods(&self, namespace: &str) -> Vec<PodIdentity> {
        self.state()
            .pods
            .values()
            .filter(|pod| pod.namespace == namespace)
            .cloned()
            .collect()
    }

    fn pods_on_node(&self, node: &str) -> Vec<PodIdentity> {
        self.state()
            .pods
            .values()
            .filter(|pod| pod.is_on_node(node))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StatusClient for MemoryCluster {
    async fn get(&self, key: &JobKey) -> Result<CaptureJob, StatusError> {
        self.state()
            .jobs
            .get(key)
            .cloned()
            .ok_or(StatusError::NotFound)
    }

    async fn update_status(
        &self,
        job: &CaptureJob,
        status: JobStatus,
    ) -> Result<CaptureJob, StatusError> {
        let mut st = self.state();
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            return Err(StatusError::Conflict);
        }

        let current = st.jobs.get(&job.key).cloned().ok_or(StatusError::NotFound)?;
        if current.resource_version != job.resource_version {
            return Err(StatusError::Conflict);
        }

        let mut updated = current.clone();
        updated.status = status;
        updated.resource_version = st.next_version();
        st.jobs.insert(updated.key.clone(), updated.clone());
        st.status_writes += 1;
        st.emit(ClusterEvent::Job(Change::Updated {
            old: current,
            new: updated.clone(),
        }));
        Ok(updated)
    }
}
