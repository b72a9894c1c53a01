use std::path::Path;

use async_trait::async_trait;
use podcap_core::CaptureRecord;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// One live capture as listed on `/api/v1/captures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureInfo {
    pub pod: String,
    pub job: String,
    pub file_location: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl From<&CaptureRecord> for CaptureInfo {
    fn from(record: &CaptureRecord) -> Self {
        Self {
            pod: record.pod.to_string(),
            job: record.job.to_string(),
            file_location: record.file_location.clone(),
            pid: record.pid,
            timeout_ms: record
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Backend of the HTTP surface.
///
/// Implemented by [`crate::BackendApiAdapter`]; tests plug in their own.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    /// Live captures, sorted by pod.
    async fn captures(&self) -> Result<Vec<CaptureInfo>, ApiError>;

    /// Metrics in Prometheus text format.
    fn metrics_text(&self) -> Result<String, ApiError>;

    /// Directory capture files are served from.
    fn capture_dir(&self) -> &Path;
}
