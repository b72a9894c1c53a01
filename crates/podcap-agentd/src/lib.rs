//! Node agent wiring: configuration from the environment, start-up order and graceful
//! shutdown of the capture supervisor, the reconcilers and the HTTP surface.
//!
//! The cluster watch/list source is supplied by the embedder as a [`ClusterCache`],
//! a [`StatusClient`] and a channel of [`ClusterEvent`]s.
//!
//! [`ClusterCache`]: podcap_core::ClusterCache
//! [`StatusClient`]: podcap_core::StatusClient
//! [`ClusterEvent`]: podcap_core::ClusterEvent

mod config;
pub use config::{AgentConfig, CRI_SOCKET_CANDIDATES, detect_cri_socket};

mod agent;
pub use agent::Agent;

mod signal;
pub use signal::cancel_on_signal;
