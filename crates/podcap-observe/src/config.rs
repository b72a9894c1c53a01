use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::{LoggerError, LoggerFormat};

/// Logger settings.
///
/// `level` is an `EnvFilter` directive string (`info`, `podcap_core=debug,info`, ...).
/// When `RUST_LOG` is set and `respect_env` is on, it takes precedence.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
    pub respect_env: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
            respect_env: true,
        }
    }
}

impl LoggerConfig {
    pub fn with_format(mut self, format: LoggerFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub(crate) fn filter(&self) -> Result<EnvFilter, LoggerError> {
        if self.respect_env
            && let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV)
            && !directives.trim().is_empty()
        {
            return EnvFilter::try_new(&directives)
                .map_err(|e| LoggerError::InvalidFilter(format!("{directives}: {e}")));
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| LoggerError::InvalidFilter(format!("{}: {e}", self.level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(level: &str) -> LoggerConfig {
        LoggerConfig {
            respect_env: false,
            ..LoggerConfig::default()
        }
        .with_level(level)
    }

    #[test]
    fn accepts_directive_lists() {
        assert!(cfg("info").filter().is_ok());
        assert!(cfg("podcap_core=debug,warn").filter().is_ok());
    }

    #[test]
    fn rejects_garbage_levels() {
        assert!(matches!(
            cfg("podcap_core=loud").filter(),
            Err(LoggerError::InvalidFilter(_))
        ));
    }
}
