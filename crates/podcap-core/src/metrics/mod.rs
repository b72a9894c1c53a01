//! Metrics seam. The core only reports events; exporting them is up to the backend.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Success,
    Failure,
}

impl StartOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            StartOutcome::Success => "success",
            StartOutcome::Failure => "failure",
        }
    }
}

/// Result of one reconciliation cycle as seen by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    /// Transient failure, requeued with backoff.
    Retry,
    /// Terminal failure, dropped without retry.
    Dropped,
    /// Retry budget exhausted.
    GivenUp,
}

impl SyncOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::Retry => "retry",
            SyncOutcome::Dropped => "dropped",
            SyncOutcome::GivenUp => "given_up",
        }
    }
}

pub trait MetricsBackend: Send + Sync + 'static {
    /// A capture start attempt passed admission and either spawned or failed.
    fn capture_started(&self, outcome: StartOutcome);

    /// The number of live capture processes changed by `delta`.
    fn capture_active(&self, delta: i64);

    fn sync_finished(&self, outcome: SyncOutcome);
}

pub type MetricsHandle = Arc<dyn MetricsBackend>;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsBackend for NoOpMetrics {
    fn capture_started(&self, _outcome: StartOutcome) {}
    fn capture_active(&self, _delta: i64) {}
    fn sync_finished(&self, _outcome: SyncOutcome) {}
}

impl NoOpMetrics {
    pub fn handle() -> MetricsHandle {
        Arc::new(NoOpMetrics)
    }
}
