//! Status writes under optimistic concurrency and single-owner arbitration.

use std::{sync::Arc, time::Duration};

use exponential_backoff::Backoff;
use podcap_model::{CaptureJob, JobKey, JobStatus, Phase};
use tracing::{debug, trace};

use crate::{cluster::StatusClient, error::StatusError};

/// Backoff between read-check-write attempts after a conflict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusBackoff {
    /// Total attempts, including the first.
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
    /// Fraction of each delay that is randomized, in `0.0..=1.0`.
    pub jitter: f32,
}

impl Default for StatusBackoff {
    fn default() -> Self {
        Self {
            steps: 4,
            initial: Duration::from_millis(10),
            factor: 5,
            jitter: 0.1,
        }
    }
}

impl StatusBackoff {
    fn schedule(&self) -> Backoff {
        let mut backoff = Backoff::new(self.steps.max(1), self.initial, None::<Duration>);
        backoff.set_factor(self.factor);
        backoff.set_jitter(self.jitter);
        backoff
    }
}

/// Writes converged job status on behalf of one node.
#[derive(Clone)]
pub struct StatusSynchronizer {
    client: Arc<dyn StatusClient>,
    node_name: Arc<str>,
    backoff: StatusBackoff,
}

impl StatusSynchronizer {
    pub fn new(client: Arc<dyn StatusClient>, node_name: impl Into<Arc<str>>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            backoff: StatusBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: StatusBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// `Completed` is terminal: once stored, only another `Completed` may replace it.
    fn applies(&self, current: &JobStatus, desired: &JobStatus) -> bool {
        if current.is_phase(Phase::Completed) && !desired.is_phase(Phase::Completed) {
            return false;
        }
        !current.is_owned_by_other(&self.node_name) && current != desired
    }

    /// Write `desired` unless it equals the known status or the status belongs to another
    /// node. Returns whether a write happened.
    pub async fn ensure_status(
        &self,
        known: &CaptureJob,
        desired: JobStatus,
    ) -> Result<bool, StatusError> {
        if !self.applies(&known.status, &desired) {
            trace!(target: "podcap.core.status", job = %known.key, "status unchanged or foreign-owned; skipping");
            return Ok(false);
        }
        self.update_status(&known.key, desired).await
    }

    /// Read-check-write loop, retried on conflict. A job deleted concurrently is a no-op.
    pub async fn update_status(
        &self,
        key: &JobKey,
        desired: JobStatus,
    ) -> Result<bool, StatusError> {
        let schedule = self.backoff.schedule();
        let steps = self.backoff.steps.max(1);

        for attempt in 1..=steps {
            let current = match self.client.get(key).await {
                Ok(job) => job,
                Err(StatusError::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            };
            if !self.applies(&current.status, &desired) {
                return Ok(false);
            }

            match self.client.update_status(&current, desired.clone()).await {
                Ok(_) => {
                    debug!(target: "podcap.core.status", job = %key, phase = ?desired.phase, "status updated");
                    return Ok(true);
                }
                Err(StatusError::NotFound) => return Ok(false),
                Err(StatusError::Conflict) if attempt < steps => {
                    let delay = schedule.next(attempt - 1).unwrap_or(self.backoff.initial);
                    debug!(target: "podcap.core.status", job = %key, attempt, ?delay, "status conflict; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StatusError::Conflict)
    }
}
