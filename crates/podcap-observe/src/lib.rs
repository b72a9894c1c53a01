//! Logging setup for the capture agent.

mod config;
pub use config::LoggerConfig;

mod error;
pub use error::LoggerError;

mod format;
pub use format::LoggerFormat;

mod init;
pub use init::logger_init;
