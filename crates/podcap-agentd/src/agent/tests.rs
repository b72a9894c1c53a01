use std::{path::Path, sync::Arc, time::Duration};

use podcap_api::axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use podcap_core::memory::MemoryCluster;
use podcap_exec::{FixedResolver, TemplateLauncher};
use podcap_model::{
    ANNOTATED_JOB_NAME, ANNOTATION_CAPTURE_FILES, CaptureJob, JobKey, JobSpec, JobStatus,
    LabelSelector, Phase, PodIdentity,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use super::*;

const NODE: &str = "node-a";

struct Harness {
    cluster: MemoryCluster,
    supervisor: CaptureSupervisor,
    metrics: PrometheusMetrics,
    router: Router,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

impl Harness {
    fn start(max_concurrent: usize) -> Self {
        Self::start_with(max_concurrent, false)
    }

    fn start_with(max_concurrent: usize, annotations: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig {
            node_name: NODE.into(),
            capture_dir: dir.path().to_path_buf(),
            max_concurrent,
            http_addr: None,
            reap_orphans: false,
            annotations,
            ..AgentConfig::default()
        };

        let supervisor = CaptureSupervisor::new(cfg.supervisor_config())
            .unwrap()
            .with_resolver(Arc::new(FixedResolver(1)))
            .with_launcher(Arc::new(TemplateLauncher::new(
                "sh",
                ["-c", "touch {output} && exec sleep 30"],
            )));

        let cluster = MemoryCluster::new();
        let events = cluster.subscribe();
        let agent = Agent::with_supervisor(
            cfg,
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            supervisor,
        )
        .unwrap();

        let supervisor = agent.supervisor().clone();
        let metrics = agent.metrics().clone();
        let router = agent.router();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(agent.run(events, cancel.clone()));

        Self {
            cluster,
            supervisor,
            metrics,
            router,
            cancel,
            task,
            _dir: dir,
        }
    }

    fn status(&self, key: &JobKey) -> Option<JobStatus> {
        self.cluster.status(key)
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
        assert!(self.supervisor.captures().is_empty());
    }
}

fn pod(name: &str, app: &str) -> PodIdentity {
    PodIdentity::new("default", name)
        .on_node(NODE)
        .with_label("app", app)
        .with_container(format!("containerd://{name}"))
}

fn job(name: &str, app: &str) -> CaptureJob {
    CaptureJob::new(
        JobKey::new("default", name),
        JobSpec::new(LabelSelector::match_labels([("app", app)])),
    )
}

fn timed_job(name: &str, app: &str) -> CaptureJob {
    let mut job = job(name, app);
    job.spec = job.spec.with_timeout(Duration::from_secs(2));
    job
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn process_alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| !stat.contains(") Z "))
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_without_local_pods_is_pending() {
    let h = Harness::start(2);
    let key = h.cluster.apply_job(job("web", "web")).key;

    eventually("pending status", || {
        h.status(&key).is_some_and(|s| s.is_phase(Phase::Pending))
    })
    .await;
    let status = h.status(&key).unwrap();
    assert_eq!(status.message, "No matching pods on this node");
    assert!(status.node_name.is_empty());
    assert!(h.supervisor.captures().is_empty());

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matched_pod_runs_until_job_is_deleted() {
    let h = Harness::start(2);
    h.cluster.apply_pod(pod("web-0", "web"));
    let key = h.cluster.apply_job(job("web", "web")).key;

    eventually("running status", || {
        h.status(&key).is_some_and(|s| s.is_phase(Phase::Running))
    })
    .await;
    let status = h.status(&key).unwrap();
    assert!(!status.file_location.is_empty());
    assert_eq!(status.node_name, NODE);

    let record = h.supervisor.captures_for_job(&key).pop().unwrap();
    assert!(process_alive(record.pid));
    let output = record.file_location.clone();
    eventually("capture output", || Path::new(&output).exists()).await;

    h.cluster.delete_job(&key);
    eventually("capture stopped", || h.supervisor.captures().is_empty()).await;
    eventually("process gone", || !process_alive(record.pid)).await;
    assert!(h.supervisor.captures_for_job(&key).is_empty());
    assert!(!Path::new(&output).exists());
    assert!(h.status(&key).is_none());

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_job_stops_every_pod_it_captures() {
    let h = Harness::start(4);
    for name in ["web-0", "web-1", "web-2"] {
        h.cluster.apply_pod(pod(name, "web"));
    }
    h.cluster.apply_pod(pod("api-0", "api"));
    let web = h.cluster.apply_job(job("web", "web")).key;
    let api = h.cluster.apply_job(job("api", "api")).key;

    eventually("all captures", || h.supervisor.captures().len() == 4).await;
    let live = h.supervisor.captures_for_job(&web);
    assert_eq!(live.len(), 3);

    h.cluster.delete_job(&web);
    eventually("web captures stopped", || h.supervisor.captures_for_job(&web).is_empty()).await;
    for record in &live {
        eventually("process gone", || !process_alive(record.pid)).await;
    }
    assert_eq!(h.supervisor.captures_for_job(&api).len(), 1);
    assert_eq!(h.supervisor.active(), 1);

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_job_starts_once_a_slot_frees_up() {
    let h = Harness::start(1);
    h.cluster.apply_pod(pod("a-0", "a"));
    h.cluster.apply_pod(pod("b-0", "b"));
    let a = h.cluster.apply_job(job("a", "a")).key;
    let b = h.cluster.apply_job(job("b", "b")).key;

    eventually("one capture", || h.supervisor.captures().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let live = h.supervisor.captures();
    assert_eq!(live.len(), 1, "admission is bounded");

    let (winner, loser) = if live[0].job == a { (a, b) } else { (b, a) };
    h.cluster.delete_job(&winner);

    eventually("loser running", || {
        h.status(&loser).is_some_and(|s| s.is_phase(Phase::Running))
    })
    .await;
    assert_eq!(h.supervisor.captures_for_job(&loser).len(), 1);
    assert_eq!(h.supervisor.active(), 1);

    let text = h.metrics.encode_text().unwrap();
    assert!(!text.contains("result=\"retry\""), "{text}");

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_job_completes_and_stays_stopped() {
    let h = Harness::start(2);
    h.cluster.apply_pod(pod("web-0", "web"));
    let key = h.cluster.apply_job(timed_job("web", "web")).key;

    eventually("capture started", || h.supervisor.captures().len() == 1).await;
    eventually("completed status", || {
        h.status(&key).is_some_and(|s| s.is_phase(Phase::Completed))
    })
    .await;

    let status = h.status(&key).unwrap();
    assert_eq!(status.message, "Capture timed out after 2s");
    assert!(Path::new(&status.file_location).exists(), "timed out capture keeps its files");

    // A spec update re-enqueues the job; it must not start again.
    h.cluster.apply_job(timed_job("web", "web"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.supervisor.captures().is_empty());
    assert!(h.status(&key).unwrap().is_phase(Phase::Completed));

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_surface_reflects_live_captures() {
    let h = Harness::start(2);
    h.cluster.apply_pod(pod("web-0", "web"));
    h.cluster.apply_job(job("web", "web"));
    eventually("capture started", || h.supervisor.captures().len() == 1).await;

    let resp = h
        .router
        .clone()
        .oneshot(Request::get("/api/v1/captures").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("\"pod\":\"default/web-0\""), "{body}");

    let resp = h
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("podcap_active_captures 1"));

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn annotated_pod_is_captured_when_enabled() {
    let h = Harness::start_with(2, true);
    h.cluster.apply_pod(
        PodIdentity::new("default", "db-0")
            .on_node(NODE)
            .with_container("containerd://db-0")
            .with_annotation(ANNOTATION_CAPTURE_FILES, "4"),
    );

    eventually("annotated capture", || h.supervisor.captures().len() == 1).await;
    let record = h.supervisor.captures().pop().unwrap();
    assert_eq!(record.job, JobKey::new("default", ANNOTATED_JOB_NAME));
    assert_eq!(record.max_files, 4);

    h.stop().await;
}

#[test]
fn cancelled_cache_wait_is_not_a_failure() {
    let cancel = CancellationToken::new();
    assert!(stopped_by(Err(CoreError::CacheSync), &cancel).is_err());
    cancel.cancel();
    assert!(stopped_by(Err(CoreError::CacheSync), &cancel).is_ok());
    assert!(stopped_by(Ok(()), &cancel).is_ok());
}
