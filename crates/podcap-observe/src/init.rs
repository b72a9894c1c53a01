use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::{LoggerConfig, LoggerError, LoggerFormat};

/// Install the global subscriber described by `cfg`. Fails if one is already installed.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let registry = tracing_subscriber::registry().with(cfg.filter()?);

    match cfg.format {
        LoggerFormat::Text => registry
            .with(
                fmt::layer()
                    .with_ansi(cfg.use_color)
                    .with_target(cfg.with_targets)
                    .with_timer(local_timer()),
            )
            .try_init()
            .map_err(init_error),
        LoggerFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_ansi(false)
                    .with_target(cfg.with_targets)
                    .with_timer(local_timer()),
            )
            .try_init()
            .map_err(init_error),
        LoggerFormat::Journald => journald(registry),
    }
}

fn local_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn init_error(e: TryInitError) -> LoggerError {
    let msg = e.to_string();
    if msg.contains("global default") {
        LoggerError::AlreadyInitialized
    } else {
        LoggerError::InitializationFailed(msg)
    }
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald<S>(registry: S) -> Result<(), LoggerError>
where
    S: tracing::Subscriber
        + for<'a> tracing_subscriber::registry::LookupSpan<'a>
        + Send
        + Sync
        + 'static,
{
    let layer = tracing_journald::layer()
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))?
        .with_syslog_identifier("podcap-agent".into());
    registry.with(layer).try_init().map_err(init_error)
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald<S>(_registry: S) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}
