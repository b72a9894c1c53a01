use podcap_core::CaptureError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("invalid supervisor config: {0}")]
    InvalidConfig(String),
    #[error("pid resolution failed: {0}")]
    Resolve(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

impl From<ExecError> for CaptureError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Resolve(msg) => CaptureError::PidResolution(msg),
            ExecError::Spawn(msg) | ExecError::Io(msg) | ExecError::InvalidConfig(msg) => {
                CaptureError::Spawn(msg)
            }
        }
    }
}
