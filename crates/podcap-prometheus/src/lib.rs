//! Prometheus backend for the capture agent's [`podcap_core::MetricsBackend`].
//!
//! ## Metrics
//! - `podcap_active_captures` - Gauge
//! - `podcap_capture_starts_total{result}` - Counter (`success` | `failure`)
//! - `podcap_syncs_total{result}` - Counter (`success` | `retry` | `dropped` | `given_up`)
//!
//! Metrics live on the backend's own [`Registry`]; the HTTP layer renders them with
//! [`PrometheusMetrics::encode_text`].

mod backend;
pub use backend::{MetricsError, PrometheusMetrics};

pub use prometheus::{Encoder, Registry, TextEncoder};
