//! HTTP surface of the capture agent.
//!
//! Routes (feature `http`):
//! - `GET /captures/{file}` - download a capture file
//! - `GET /healthz` - liveness
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /api/v1/captures` - live captures on this node

mod error;
pub use error::ApiError;

mod handler;
pub use handler::{ApiHandler, CaptureInfo};

mod adapter;
pub use adapter::BackendApiAdapter;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpApi, serve};

#[cfg(feature = "http")]
pub use axum;
