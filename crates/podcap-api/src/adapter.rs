use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use podcap_core::CaptureBackend;
use podcap_prometheus::PrometheusMetrics;

use crate::{
    error::ApiError,
    handler::{ApiHandler, CaptureInfo},
};

/// Serves the API straight from a [`CaptureBackend`] and its metrics registry.
pub struct BackendApiAdapter {
    backend: Arc<dyn CaptureBackend>,
    metrics: Option<PrometheusMetrics>,
    capture_dir: PathBuf,
}

impl BackendApiAdapter {
    pub fn new(backend: Arc<dyn CaptureBackend>, capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            metrics: None,
            capture_dir: capture_dir.into(),
        }
    }

    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl ApiHandler for BackendApiAdapter {
    async fn captures(&self) -> Result<Vec<CaptureInfo>, ApiError> {
        Ok(self.backend.captures().iter().map(CaptureInfo::from).collect())
    }

    fn metrics_text(&self) -> Result<String, ApiError> {
        match &self.metrics {
            Some(metrics) => Ok(metrics.encode_text()?),
            None => Ok(String::new()),
        }
    }

    fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }
}
