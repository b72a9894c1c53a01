//! Seam between the reconciler and the process supervisor.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use podcap_model::{JobKey, PodKey};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CaptureError;

/// Identity of one capture process incarnation.
///
/// Ids are never reused, so callbacks bound to an old incarnation (exit observer, timeout
/// timer) can detect that the live record for their pod has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to start one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub pod: PodKey,
    pub job: JobKey,
    /// Runtime-qualified container identifier (`<runtime>://<id>`).
    pub container: String,
    /// Number of rotated output files.
    pub max_files: u32,
    pub timeout: Option<Duration>,
}

/// Snapshot of a live capture (the per-pod capture state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub id: CaptureId,
    pub pod: PodKey,
    pub job: JobKey,
    /// Path of the first output file.
    pub file_location: String,
    /// Glob matching every rotated output file of this capture.
    pub file_pattern: String,
    pub max_files: u32,
    pub timeout: Option<Duration>,
    /// Process (group) id of the capture process.
    pub pid: u32,
}

/// What happens to output files when a capture is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Delete every file matching the capture's pattern.
    Discard,
    /// Keep the files (the capture finished and its output is the result).
    Retain,
}

/// Admission-controlled supervisor of capture processes.
///
/// Implementations keep the live-capture table and the job → pods index consistent under one
/// lock: every record reachable by pod key is reachable from its job's index entry and vice
/// versa, and at most one record exists per pod key.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    /// Admit and start a capture. Returns [`CaptureError::AtCapacity`] without blocking when
    /// no admission slot is free.
    async fn start(
        &self,
        req: CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptureRecord, CaptureError>;

    /// Stop the capture of `pod`, if any, and return its final record.
    async fn stop(&self, pod: &PodKey, mode: StopMode) -> Option<CaptureRecord>;

    /// Stop the capture of `pod` only if it is still incarnation `id`, retaining its files.
    ///
    /// Called from the capture's own timeout timer, so the timer is not cancelled.
    async fn stop_expired(&self, pod: &PodKey, id: CaptureId) -> Option<CaptureRecord>;

    /// Bind a timeout timer to incarnation `id`. Returns `false` if that incarnation is gone;
    /// the caller then aborts the timer itself.
    fn attach_timer(&self, pod: &PodKey, id: CaptureId, timer: AbortHandle) -> bool;

    fn capture(&self, pod: &PodKey) -> Option<CaptureRecord>;

    /// Live captures owned by `job` (served from the job → pods index).
    fn captures_for_job(&self, job: &JobKey) -> Vec<CaptureRecord>;

    fn captures(&self) -> Vec<CaptureRecord>;

    /// Most recently modified output file across `records`, falling back to the first
    /// record's file location. `None` when `records` is empty.
    fn latest_artifact(&self, records: &[CaptureRecord]) -> Option<String>;

    /// Best-effort removal of every output file belonging to `job`.
    fn cleanup_job_artifacts(&self, job: &JobKey);
}
