//! Annotation-driven variant: a pod on this node annotated with
//! `podcap.io/capture-files: "<N>"` is captured with `N` rotated files.
//!
//! Work is keyed by pod. Captures are recorded under the per-namespace job
//! `<namespace>/annotated`, so they share the supervisor's job index and artifact naming
//! with selector-driven jobs. Removing the annotation (or the pod) stops the capture and
//! keeps its files.

use std::sync::Arc;

use podcap_model::{ANNOTATED_JOB_NAME, ANNOTATION_CAPTURE_FILES, JobKey, PodIdentity, PodKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{CaptureBackend, CaptureRequest, StopMode},
    cluster::{ClusterCache, ClusterEvent, EventHandler, wait_for_cache_sync},
    error::{CaptureError, CoreError},
    metrics::{MetricsHandle, NoOpMetrics},
    queue::{WorkQueue, run_workers},
    reconciler::{ContainerPolicy, FirstContainer, ReconcilerConfig},
};

#[derive(Clone)]
pub struct AnnotationReconciler {
    cfg: Arc<ReconcilerConfig>,
    cache: Arc<dyn ClusterCache>,
    backend: Arc<dyn CaptureBackend>,
    policy: Arc<dyn ContainerPolicy>,
    metrics: MetricsHandle,
    queue: WorkQueue<PodKey>,
}

impl AnnotationReconciler {
    pub fn new(
        cfg: ReconcilerConfig,
        cache: Arc<dyn ClusterCache>,
        backend: Arc<dyn CaptureBackend>,
    ) -> Self {
        let queue = WorkQueue::new(cfg.retry);
        Self {
            cfg: Arc::new(cfg),
            cache,
            backend,
            policy: Arc::new(FirstContainer),
            metrics: NoOpMetrics::handle(),
            queue,
        }
    }

    pub fn with_container_policy(mut self, policy: Arc<dyn ContainerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &WorkQueue<PodKey> {
        &self.queue
    }

    fn is_annotated_capture(&self, pod: &PodKey) -> bool {
        self.backend
            .capture(pod)
            .is_some_and(|record| record.job.name() == ANNOTATED_JOB_NAME)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CoreError> {
        wait_for_cache_sync(self.cache.as_ref(), &cancel).await?;

        for pod in self.cache.pods_on_node(&self.cfg.node_name) {
            if pod.annotations.contains_key(ANNOTATION_CAPTURE_FILES) {
                self.queue.add(pod.key());
            }
        }

        let this = self.clone();
        let worker_cancel = cancel.clone();
        run_workers(
            self.queue.clone(),
            self.cfg.workers,
            self.metrics.clone(),
            cancel,
            move |key: PodKey| {
                let this = this.clone();
                let cancel = worker_cancel.clone();
                async move { this.sync(&key, &cancel).await }
            },
        )
        .await;
        Ok(())
    }

    /// Bring the capture of one pod in line with its annotation.
    pub async fn sync(&self, key: &PodKey, cancel: &CancellationToken) -> Result<(), CoreError> {
        let pod = self
            .cache
            .pod(key)
            .filter(|pod| pod.is_on_node(&self.cfg.node_name));
        let requested = pod
            .as_ref()
            .and_then(|pod| pod.annotations.get(ANNOTATION_CAPTURE_FILES));

        let Some((pod, raw)) = pod.as_ref().zip(requested) else {
            self.stop_annotated(key, "annotation or pod removed").await;
            return Ok(());
        };

        let Some(max_files) = parse_capture_files(raw) else {
            self.stop_annotated(key, "invalid annotation").await;
            return Err(CoreError::InvalidAnnotation {
                pod: key.clone(),
                value: raw.clone(),
            });
        };

        if let Some(existing) = self.backend.capture(key) {
            if existing.job.name() != ANNOTATED_JOB_NAME {
                debug!(target: "podcap.core.annotation", pod = %key, owner = %existing.job, "pod already captured by a job");
                return Ok(());
            }
            if existing.max_files == max_files {
                return Ok(());
            }
            info!(target: "podcap.core.annotation", pod = %key, from = existing.max_files, to = max_files, "file count changed; restarting capture");
            self.backend.stop(key, StopMode::Retain).await;
        }

        self.start(pod, max_files, cancel).await
    }

    async fn start(
        &self,
        pod: &PodIdentity,
        max_files: u32,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let key = pod.key();
        let Some(container) = self.policy.select(pod) else {
            warn!(target: "podcap.core.annotation", pod = %key, "no container id yet; skipping pod");
            return Ok(());
        };

        let req = CaptureRequest {
            pod: key.clone(),
            job: JobKey::new(key.namespace(), ANNOTATED_JOB_NAME),
            container,
            max_files,
            timeout: None,
        };
        match self.backend.start(req, cancel).await {
            Ok(record) => {
                info!(target: "podcap.core.annotation", pod = %key, file = %record.file_location, max_files, "capture started");
                Ok(())
            }
            Err(CaptureError::AtCapacity) => {
                info!(target: "podcap.core.annotation", pod = %key, "max concurrent captures reached; rescheduling pod");
                self.queue.add_after(key, self.cfg.at_capacity_delay);
                Ok(())
            }
            Err(CaptureError::InvalidContainer(e)) => {
                warn!(target: "podcap.core.annotation", pod = %key, error = %e, "unusable container id; skipping pod");
                Ok(())
            }
            Err(e) => Err(CoreError::capture(&key, e)),
        }
    }

    async fn stop_annotated(&self, key: &PodKey, reason: &str) {
        if !self.is_annotated_capture(key) {
            return;
        }
        info!(target: "podcap.core.annotation", pod = %key, reason, "stopping capture");
        self.backend.stop(key, StopMode::Retain).await;
    }
}

impl EventHandler for AnnotationReconciler {
    fn on_event(&self, event: &ClusterEvent) {
        let ClusterEvent::Pod(change) = event else {
            return;
        };
        for pod in change.objects() {
            if !pod.is_on_node(&self.cfg.node_name) {
                continue;
            }
            let key = pod.key();
            if pod.annotations.contains_key(ANNOTATION_CAPTURE_FILES) || self.is_annotated_capture(&key) {
                self.queue.add(key);
            }
        }
    }
}

/// Positive rotation count, or `None` for anything else.
fn parse_capture_files(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use podcap_model::{CaptureJob, JobSpec, LabelSelector};

    use super::*;
    use crate::{
        CaptureRecord,
        cluster::Change,
        memory::{MemoryBackend, MemoryCluster},
        reconciler::Reconciler,
    };

    const NODE: &str = "node-a";

    fn setup(capacity: usize) -> (MemoryCluster, MemoryBackend, AnnotationReconciler) {
        let cluster = MemoryCluster::new();
        let backend = MemoryBackend::with_capacity(capacity);
        let reconciler = AnnotationReconciler::new(
            ReconcilerConfig::new(NODE),
            Arc::new(cluster.clone()),
            Arc::new(backend.clone()),
        );
        (cluster, backend, reconciler)
    }

    fn annotated(name: &str, files: &str) -> PodIdentity {
        PodIdentity::new("default", name)
            .on_node(NODE)
            .with_container(format!("containerd://{name}"))
            .with_annotation(ANNOTATION_CAPTURE_FILES, files)
    }

    fn live(backend: &MemoryBackend, pod: &PodKey) -> Option<CaptureRecord> {
        backend.capture(pod)
    }

    #[test]
    fn capture_files_must_be_positive_integers() {
        assert_eq!(parse_capture_files("3"), Some(3));
        assert_eq!(parse_capture_files(" 10 "), Some(10));
        for bad in ["0", "-1", "three", "", "1.5"] {
            assert_eq!(parse_capture_files(bad), None, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn annotation_starts_restarts_and_stops() {
        let (cluster, backend, rec) = setup(5);
        let cancel = CancellationToken::new();
        let key = PodKey::new("default", "web-0");

        cluster.apply_pod(annotated("web-0", "3"));
        rec.sync(&key, &cancel).await.unwrap();
        let record = live(&backend, &key).unwrap();
        assert_eq!(record.max_files, 3);
        assert_eq!(record.job, JobKey::new("default", ANNOTATED_JOB_NAME));

        cluster.apply_pod(annotated("web-0", "5"));
        rec.sync(&key, &cancel).await.unwrap();
        assert_eq!(live(&backend, &key).unwrap().max_files, 5);

        cluster.apply_pod(
            PodIdentity::new("default", "web-0")
                .on_node(NODE)
                .with_container("containerd://web-0"),
        );
        rec.sync(&key, &cancel).await.unwrap();
        assert!(live(&backend, &key).is_none());
        assert!(backend.stops().iter().all(|(_, mode)| *mode == StopMode::Retain));
    }

    #[tokio::test]
    async fn invalid_annotation_is_terminal() {
        let (cluster, backend, rec) = setup(5);
        let key = PodKey::new("default", "web-0");
        cluster.apply_pod(annotated("web-0", "zero"));

        let err = rec.sync(&key, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(backend.captures().is_empty());
    }

    #[tokio::test]
    async fn selector_job_capture_is_not_touched() {
        let (cluster, backend, rec) = setup(5);
        let cancel = CancellationToken::new();
        let key = PodKey::new("default", "web-0");

        let jobs = Reconciler::builder(
            ReconcilerConfig::new(NODE),
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            Arc::new(backend.clone()),
        )
        .build();
        let job = cluster.apply_job(CaptureJob::new(
            JobKey::new("default", "web"),
            JobSpec::new(LabelSelector::match_labels([("app", "web")])),
        ));
        cluster.apply_pod(annotated("web-0", "2").with_label("app", "web"));
        jobs.sync(&job.key, &cancel).await.unwrap();

        rec.sync(&key, &cancel).await.unwrap();
        assert_eq!(live(&backend, &key).unwrap().job, job.key);

        cluster.delete_pod(&key);
        rec.sync(&key, &cancel).await.unwrap();
        assert!(live(&backend, &key).is_some(), "selector capture is owned by its job");
    }

    #[tokio::test]
    async fn only_local_annotated_pods_are_queued() {
        let (_cluster, _backend, rec) = setup(5);

        rec.on_event(&ClusterEvent::Pod(Change::Added(
            annotated("remote", "3").on_node("node-b"),
        )));
        rec.on_event(&ClusterEvent::Pod(Change::Added(
            PodIdentity::new("default", "plain").on_node(NODE),
        )));
        assert!(rec.queue().is_empty());

        rec.on_event(&ClusterEvent::Pod(Change::Added(annotated("web-0", "3"))));
        assert_eq!(rec.queue().get().await, Some(PodKey::new("default", "web-0")));
    }
}
