use podcap_core::{MetricsBackend, StartOutcome, SyncOutcome};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder, proto::MetricFamily};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics are not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    active: IntGauge,
    starts: IntCounterVec,
    syncs: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let active = IntGauge::new("podcap_active_captures", "Number of running capture processes")?;
        let starts = IntCounterVec::new(
            Opts::new("podcap_capture_starts_total", "Capture start attempts past admission"),
            &["result"],
        )?;
        let syncs = IntCounterVec::new(
            Opts::new("podcap_syncs_total", "Reconciliation cycles by outcome"),
            &["result"],
        )?;

        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(starts.clone()))?;
        registry.register(Box::new(syncs.clone()))?;

        Ok(Self {
            registry,
            active,
            starts,
            syncs,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format, as served on `/metrics`.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl MetricsBackend for PrometheusMetrics {
    fn capture_started(&self, outcome: StartOutcome) {
        self.starts.with_label_values(&[outcome.as_label()]).inc();
    }

    fn capture_active(&self, delta: i64) {
        self.active.add(delta);
    }

    fn sync_finished(&self, outcome: SyncOutcome) {
        self.syncs.with_label_values(&[outcome.as_label()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_encodes() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.capture_started(StartOutcome::Success);
        metrics.capture_started(StartOutcome::Failure);
        metrics.capture_active(1);
        metrics.capture_active(1);
        metrics.capture_active(-1);
        metrics.sync_finished(SyncOutcome::GivenUp);

        assert_eq!(metrics.active.get(), 1);
        assert_eq!(metrics.starts.with_label_values(&["success"]).get(), 1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("podcap_active_captures 1"));
        assert!(text.contains(r#"podcap_capture_starts_total{result="failure"} 1"#));
        assert!(text.contains(r#"podcap_syncs_total{result="given_up"} 1"#));
    }

    #[test]
    fn instances_do_not_share_registries() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();
        a.capture_active(3);
        assert_eq!(b.active.get(), 0);
    }
}
