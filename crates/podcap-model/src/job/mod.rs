use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{JobKey, JobStatus, LabelSelector, TimeoutMs};

/// Desired state of a capture job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Pods (in the job's namespace) to capture.
    #[serde(default)]
    pub pod_selector: LabelSelector,
    /// Per-pod capture duration; zero means "capture until stopped".
    #[serde(default)]
    pub timeout_ms: TimeoutMs,
}

impl JobSpec {
    pub fn new(pod_selector: LabelSelector) -> Self {
        Self {
            pod_selector,
            timeout_ms: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as TimeoutMs;
        self
    }

    /// Configured timeout, or `None` when captures run until stopped.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// A capture job resource as read from the cluster.
///
/// `resource_version` is the optimistic-concurrency token: a status write carrying a stale
/// version is rejected with a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureJob {
    pub key: JobKey,
    #[serde(default)]
    pub resource_version: u64,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl CaptureJob {
    pub fn new(key: JobKey, spec: JobSpec) -> Self {
        Self {
            key,
            resource_version: 0,
            spec,
            status: JobStatus::default(),
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        self.key.namespace()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.key.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_means_none() {
        let spec = JobSpec::default();
        assert_eq!(spec.timeout(), None);

        let spec = spec.with_timeout(Duration::from_secs(2));
        assert_eq!(spec.timeout_ms, 2_000);
        assert_eq!(spec.timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn job_resource_roundtrip() {
        let job = CaptureJob::new(
            JobKey::new("default", "web"),
            JobSpec::new(LabelSelector::match_labels([("app", "web")]))
                .with_timeout(Duration::from_secs(30)),
        );
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""key":"default/web""#));
        assert!(json.contains(r#""timeoutMs":30000"#));

        let back: CaptureJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
