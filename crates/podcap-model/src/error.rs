use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid key '{0}' (expected: namespace/name)")]
    InvalidKey(String),
    #[error("invalid container ID format: {0}")]
    InvalidContainerId(String),
    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
}
