use podcap_model::{JobKey, ModelError, PodKey};
use thiserror::Error;

/// Failures surfaced by a [`CaptureBackend`](crate::CaptureBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Every admission slot is held; callers reschedule instead of blocking.
    #[error("max concurrent captures reached")]
    AtCapacity,
    #[error("capture start cancelled")]
    Cancelled,
    #[error("capture already running for {0}")]
    AlreadyRunning(PodKey),
    #[error("invalid container identity: {0}")]
    InvalidContainer(#[from] ModelError),
    #[error("failed to get container PID: {0}")]
    PidResolution(String),
    #[error("failed to start capture process: {0}")]
    Spawn(String),
}

/// Failures of the status resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("job not found")]
    NotFound,
    #[error("the object has been modified; please apply your changes to the latest version")]
    Conflict,
    #[error("status backend: {0}")]
    Backend(String),
}

/// How the work queue treats a failed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff up to the bounded retry count.
    Transient,
    /// Dropped without consuming a retry.
    Terminal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("capture for pod {pod}: {source}")]
    Capture {
        pod: PodKey,
        #[source]
        source: CaptureError,
    },
    #[error("status of {job}: {source}")]
    Status {
        job: JobKey,
        #[source]
        source: StatusError,
    },
    #[error("invalid capture annotation on pod {pod}: {value:?}")]
    InvalidAnnotation { pod: PodKey, value: String },
    #[error("cancelled while waiting for caches to sync")]
    CacheSync,
}

impl CoreError {
    pub fn capture(pod: &PodKey, source: CaptureError) -> Self {
        CoreError::Capture {
            pod: pod.clone(),
            source,
        }
    }

    pub fn status(job: &JobKey, source: StatusError) -> Self {
        CoreError::Status {
            job: job.clone(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Capture { source, .. } => match source {
                CaptureError::InvalidContainer(_) | CaptureError::Cancelled => ErrorClass::Terminal,
                CaptureError::AtCapacity
                | CaptureError::AlreadyRunning(_)
                | CaptureError::PidResolution(_)
                | CaptureError::Spawn(_) => ErrorClass::Transient,
            },
            CoreError::Status { .. } => ErrorClass::Transient,
            CoreError::InvalidAnnotation { .. } | CoreError::CacheSync => ErrorClass::Terminal,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}
