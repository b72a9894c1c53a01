//! Admission-controlled capture supervisor.
//!
//! ## Lifecycle of one capture
//!
//! ```text
//! start ─► admit (slot) ─► resolve pid ─► spawn (own process group)
//!                                           │
//!                                           ├─► observer task: drain stderr, wait for exit
//!                                           └─► insert record (table + job index)
//!
//! stop / stop_expired / process exit
//!   └─► remove record under the table lock (slot released with it)
//!         └─► ask the observer to kill, join it, delete files (Discard only)
//! ```
//!
//! Whoever removes a record from the table owns its teardown. The observer only removes a
//! record that still carries its own [`CaptureId`], so a replaced incarnation is never
//! touched, and it waits until the record has been inserted before looking.
//!
//! Only the observer signals the process group, and only while the child is unreaped, so a
//! recycled pid is never hit.

mod table;

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use podcap_core::{
    CaptureBackend, CaptureError, CaptureId, CaptureRecord, CaptureRequest, MetricsHandle,
    NoOpMetrics, StartOutcome, StopMode,
};
use podcap_model::{ContainerRef, JobKey, PodKey};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr},
    sync::oneshot,
    task::AbortHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CaptureLauncher, CriResolver, ExecError, ExecResult, LaunchSpec, NsenterTcpdump, PidResolver,
    SupervisorConfig,
    admission::Slot,
    artifacts::{self, ArtifactLayout},
    kill_process_group,
    limits::apply_limits,
    orphan,
};
use table::{LiveCapture, Removed, Table};

/// How long the observer waits for the stderr drain once the process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A spawned process not yet visible in the table.
struct Spawned {
    child: Child,
    pid: u32,
    output: PathBuf,
    pattern: String,
}

#[derive(Clone)]
pub struct CaptureSupervisor {
    cfg: Arc<SupervisorConfig>,
    layout: ArtifactLayout,
    resolver: Arc<dyn PidResolver>,
    launcher: Arc<dyn CaptureLauncher>,
    metrics: MetricsHandle,
    table: Arc<Mutex<Table>>,
}

impl CaptureSupervisor {
    /// Validate `cfg`, create the capture directory and, if configured, kill capture
    /// processes left behind by a previous run.
    pub fn new(cfg: SupervisorConfig) -> ExecResult<Self> {
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.capture_dir).map_err(|e| {
            ExecError::Io(format!("create {}: {e}", cfg.capture_dir.display()))
        })?;

        let layout = ArtifactLayout::new(&cfg.capture_dir, &cfg.file_prefix);
        if cfg.reap_orphans {
            let reaped = orphan::reap_orphans(&layout.owner_marker());
            if reaped > 0 {
                info!(target: "podcap.exec.supervisor", reaped, "reaped orphaned capture processes");
            }
        }

        info!(
            target: "podcap.exec.supervisor",
            dir = %cfg.capture_dir.display(),
            max_concurrent = cfg.max_concurrent,
            "capture supervisor ready"
        );
        Ok(Self {
            table: Arc::new(Mutex::new(Table::new(cfg.max_concurrent))),
            cfg: Arc::new(cfg),
            layout,
            resolver: Arc::new(CriResolver::default()),
            launcher: Arc::new(NsenterTcpdump::default()),
            metrics: NoOpMetrics::handle(),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PidResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn CaptureLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of live capture processes.
    pub fn active(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop every capture, keeping its files.
    pub async fn shutdown(&self) {
        let pods: Vec<PodKey> = self.table().records().map(|r| r.pod.clone()).collect();
        if !pods.is_empty() {
            info!(target: "podcap.exec.supervisor", captures = pods.len(), "stopping all captures");
        }
        for pod in pods {
            self.stop(&pod, StopMode::Retain).await;
        }
    }

    async fn spawn(
        &self,
        req: &CaptureRequest,
        container: &ContainerRef,
        cancel: &CancellationToken,
    ) -> Result<Spawned, CaptureError> {
        let target_pid = tokio::select! {
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            pid = self.resolver.resolve(container) => pid?,
        };

        let output = self.layout.output(&req.job, &req.pod);
        let pattern = self.layout.capture_pattern(&req.job, &req.pod);
        let spec = LaunchSpec {
            pid: target_pid,
            output: &output,
            max_files: req.max_files,
            chunk_size_mb: self.cfg.chunk_size_mb,
            interface: &self.cfg.interface,
        };

        let mut cmd = self.launcher.command(&spec);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        apply_limits(&mut cmd, &self.cfg.limits);

        let child = cmd
            .spawn()
            .map_err(|e| CaptureError::from(ExecError::Spawn(e.to_string())))?;
        let pid = child
            .id()
            .ok_or_else(|| CaptureError::Spawn("process exited before its pid was read".into()))?;

        Ok(Spawned {
            child,
            pid,
            output,
            pattern,
        })
    }

    /// Make a spawned process visible, or kill it if another start for the pod won.
    fn register(
        &self,
        req: CaptureRequest,
        spawned: Spawned,
        slot: Slot,
    ) -> Result<CaptureRecord, CaptureError> {
        let Spawned {
            child,
            pid,
            output,
            pattern,
        } = spawned;

        let (registered_tx, registered_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let observer = tokio::spawn(observe(
            self.table.clone(),
            self.metrics.clone(),
            req.pod.clone(),
            child,
            kill.clone(),
            registered_rx,
        ));

        let mut table = self.table();
        if table.contains(&req.pod) {
            table.slots.release(slot);
            drop(table);
            debug!(target: "podcap.exec.supervisor", pod = %req.pod, pid, "killing duplicate capture");
            kill.cancel();
            return Err(CaptureError::AlreadyRunning(req.pod));
        }

        let id = table.next_id();
        let record = CaptureRecord {
            id,
            pod: req.pod,
            job: req.job,
            file_location: output.to_string_lossy().into_owned(),
            file_pattern: pattern,
            max_files: req.max_files,
            timeout: req.timeout,
            pid,
        };
        table.insert(LiveCapture {
            record: record.clone(),
            timer: None,
            kill,
            observer: Some(observer),
            slot,
        });
        drop(table);
        self.metrics.capture_active(1);

        // The observer may already have seen the exit; it removes the record on receipt.
        let _ = registered_tx.send(id);
        Ok(record)
    }

    async fn teardown(&self, removed: Removed, mode: StopMode) -> CaptureRecord {
        let Removed {
            record,
            kill,
            observer,
            ..
        } = removed;
        self.metrics.capture_active(-1);

        kill.cancel();
        if let Some(observer) = observer {
            match tokio::time::timeout(self.cfg.join_timeout, observer).await {
                Ok(Ok(killed)) => {
                    debug!(target: "podcap.exec.supervisor", pod = %record.pod, pid = record.pid, killed, "capture process joined");
                }
                Ok(Err(e)) => {
                    warn!(target: "podcap.exec.supervisor", pod = %record.pod, error = %e, "capture observer failed");
                }
                Err(_) => {
                    warn!(target: "podcap.exec.supervisor", pod = %record.pod, pid = record.pid, "capture process did not exit in time");
                }
            }
        }

        if mode == StopMode::Discard {
            let removed = artifacts::remove_matching(&record.file_pattern, &[]);
            debug!(target: "podcap.exec.supervisor", pod = %record.pod, removed, "discarded capture files");
        }
        info!(target: "podcap.exec.supervisor", pod = %record.pod, id = %record.id, ?mode, "capture stopped");
        record
    }
}

#[async_trait]
impl CaptureBackend for CaptureSupervisor {
    async fn start(
        &self,
        req: CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptureRecord, CaptureError> {
        let container: ContainerRef = req.container.parse()?;

        let slot = {
            let mut table = self.table();
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }
            if table.contains(&req.pod) {
                return Err(CaptureError::AlreadyRunning(req.pod));
            }
            table.slots.try_acquire().ok_or(CaptureError::AtCapacity)?
        };

        let result = match self.spawn(&req, &container, cancel).await {
            Ok(spawned) => self.register(req, spawned, slot),
            Err(e) => {
                self.table().slots.release(slot);
                Err(e)
            }
        };

        match &result {
            Ok(record) => {
                self.metrics.capture_started(StartOutcome::Success);
                info!(target: "podcap.exec.supervisor", pod = %record.pod, id = %record.id, pid = record.pid, "capture process started");
            }
            Err(CaptureError::AlreadyRunning(_) | CaptureError::Cancelled) => {}
            Err(e) => {
                self.metrics.capture_started(StartOutcome::Failure);
                warn!(target: "podcap.exec.supervisor", error = %e, "capture start failed");
            }
        }
        result
    }

    async fn stop(&self, pod: &PodKey, mode: StopMode) -> Option<CaptureRecord> {
        let removed = self.table().remove(pod)?;
        if let Some(timer) = &removed.timer {
            timer.abort();
        }
        Some(self.teardown(removed, mode).await)
    }

    async fn stop_expired(&self, pod: &PodKey, id: CaptureId) -> Option<CaptureRecord> {
        let removed = self.table().remove_if(pod, id)?;
        Some(self.teardown(removed, StopMode::Retain).await)
    }

    fn attach_timer(&self, pod: &PodKey, id: CaptureId, timer: AbortHandle) -> bool {
        match self.table().get_mut(pod) {
            Some(live) if live.record.id == id => {
                live.timer = Some(timer);
                true
            }
            _ => false,
        }
    }

    fn capture(&self, pod: &PodKey) -> Option<CaptureRecord> {
        self.table().get(pod).map(|live| live.record.clone())
    }

    fn captures_for_job(&self, job: &JobKey) -> Vec<CaptureRecord> {
        self.table().records_for_job(job)
    }

    fn captures(&self) -> Vec<CaptureRecord> {
        let mut records: Vec<_> = self.table().records().cloned().collect();
        records.sort_by(|a, b| a.pod.cmp(&b.pod));
        records
    }

    fn latest_artifact(&self, records: &[CaptureRecord]) -> Option<String> {
        let first = records.first()?;
        let newest = artifacts::newest_matching(records.iter().map(|r| r.file_pattern.as_str()));
        Some(
            newest
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_else(|| first.file_location.clone()),
        )
    }

    fn cleanup_job_artifacts(&self, job: &JobKey) {
        let live: Vec<String> = self
            .table()
            .records()
            .map(|r| r.file_pattern.clone())
            .collect();
        let removed = artifacts::remove_matching(&self.layout.job_pattern(job), &live);
        if removed > 0 {
            info!(target: "podcap.exec.supervisor", %job, removed, "removed job capture files");
        }
    }
}

/// Drain stderr, wait for the process to exit, then drop its record if it is still ours.
///
/// Cancelling `kill` before the child has been reaped kills its process group. Returns
/// whether that happened.
async fn observe(
    table: Arc<Mutex<Table>>,
    metrics: MetricsHandle,
    pod: PodKey,
    mut child: Child,
    kill: CancellationToken,
    registered: oneshot::Receiver<CaptureId>,
) -> bool {
    let pid = child.id();
    let drain_cancel = CancellationToken::new();
    let drain = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(drain_stderr(pod.clone(), stderr, drain_cancel.clone())));

    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            // Not reaped yet, so the group id still belongs to this capture.
            if let Some(pid) = pid {
                match kill_process_group(pid) {
                    Ok(()) => killed = true,
                    Err(e) => warn!(target: "podcap.exec.capture", %pod, pid, error = %e, "failed to kill capture process group"),
                }
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => debug!(target: "podcap.exec.capture", %pod, %status, "capture process exited"),
        Err(e) => warn!(target: "podcap.exec.capture", %pod, error = %e, "failed to wait for capture process"),
    }

    if let Some(mut drain) = drain
        && tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err()
    {
        drain_cancel.cancel();
        let _ = drain.await;
    }

    // A dropped sender means the process lost a start race and was never registered.
    let Ok(id) = registered.await else {
        return killed;
    };
    let removed = table
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove_if(&pod, id);
    if let Some(removed) = removed {
        if let Some(timer) = removed.timer {
            timer.abort();
        }
        metrics.capture_active(-1);
        info!(target: "podcap.exec.capture", %pod, %id, "capture process ended on its own; record removed");
    }
    killed
}

async fn drain_stderr(pod: PodKey, stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(target: "podcap.exec.capture", %pod, %line, "capture stderr"),
                _ => break,
            },
        }
    }
}
