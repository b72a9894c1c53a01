//! Seams to the cluster: a level-triggered cache of pods and jobs, its change notifications,
//! and the job status resource.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use podcap_model::{CaptureJob, JobKey, JobStatus, PodIdentity, PodKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CoreError, StatusError};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read side of the watch/list cache.
pub trait ClusterCache: Send + Sync + 'static {
    /// `true` once the initial list of pods and jobs has been loaded.
    fn has_synced(&self) -> bool;

    fn job(&self, key: &JobKey) -> Option<CaptureJob>;

    fn jobs(&self) -> Vec<CaptureJob>;

    fn pod(&self, key: &PodKey) -> Option<PodIdentity>;

    /// Pods of one namespace, on every node.
    fn pods(&self, namespace: &str) -> Vec<PodIdentity>;

    /// Pods scheduled on `node`, in every namespace.
    fn pods_on_node(&self, node: &str) -> Vec<PodIdentity>;
}

/// Job status resource with optimistic concurrency.
#[async_trait]
pub trait StatusClient: Send + Sync + 'static {
    /// Fetch the current job resource, bypassing the cache.
    async fn get(&self, key: &JobKey) -> Result<CaptureJob, StatusError>;

    /// Replace the status of `job`. Fails with [`StatusError::Conflict`] when
    /// `job.resource_version` is stale.
    async fn update_status(
        &self,
        job: &CaptureJob,
        status: JobStatus,
    ) -> Result<CaptureJob, StatusError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T> Change<T> {
    /// Every object version carried by the change (both sides of an update).
    pub fn objects(&self) -> impl Iterator<Item = &T> {
        let (first, second) = match self {
            Change::Added(obj) | Change::Deleted(obj) => (obj, None),
            Change::Updated { old, new } => (old, Some(new)),
        };
        std::iter::once(first).chain(second)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Pod(Change<PodIdentity>),
    Job(Change<CaptureJob>),
}

/// Consumer of change notifications. Handlers only enqueue work; they never block.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ClusterEvent);
}

/// Fan change notifications out to `handlers` until the channel closes or `cancel` fires.
pub async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    debug!(target: "podcap.core", "event source closed");
                    break;
                };
                trace!(target: "podcap.core", ?event, "dispatching cluster event");
                for handler in &handlers {
                    handler.on_event(&event);
                }
            }
        }
    }
}

/// Wait until `cache` reports its initial list loaded.
pub async fn wait_for_cache_sync(
    cache: &dyn ClusterCache,
    cancel: &CancellationToken,
) -> Result<(), CoreError> {
    while !cache.has_synced() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::CacheSync),
            _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
        }
    }
    Ok(())
}
