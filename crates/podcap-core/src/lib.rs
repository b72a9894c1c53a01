//! Reconciliation core of the capture agent.
//!
//! The crate owns the control loop and defines the seams to everything it does not own:
//! - [`ClusterCache`] / [`StatusClient`]: the watch/list cache and the status resource;
//! - [`CaptureBackend`]: the process supervisor (implemented by `podcap-exec`);
//! - [`MetricsBackend`]: metrics export (implemented by `podcap-prometheus`).

pub mod error;
pub use error::{CaptureError, CoreError, ErrorClass, StatusError};

pub mod backend;
pub use backend::{CaptureBackend, CaptureId, CaptureRecord, CaptureRequest, StopMode};

pub mod cluster;
pub use cluster::{
    Change, ClusterCache, ClusterEvent, EventHandler, StatusClient, dispatch_events,
    wait_for_cache_sync,
};

pub mod metrics;
pub use metrics::{MetricsBackend, MetricsHandle, NoOpMetrics, StartOutcome, SyncOutcome};

pub mod queue;
pub use queue::{RetryPolicy, WorkQueue};

pub mod status;
pub use status::{StatusBackoff, StatusSynchronizer};

pub mod reconciler;
pub use reconciler::{ContainerPolicy, FirstContainer, Reconciler, ReconcilerBuilder, ReconcilerConfig};

pub mod annotation;
pub use annotation::AnnotationReconciler;

#[cfg(any(test, feature = "memory"))]
pub mod memory;
