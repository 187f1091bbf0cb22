//! Structured logging setup for processes embedding the channel runtime.
//!
//! Library code only emits `tracing` events. Binaries and test harnesses
//! call [`initialise`] once to route them to stderr in the configured
//! format; applications with their own subscriber can reuse
//! [`filter_for`] and skip [`initialise`] entirely.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tcf_config::{Config, LogFormat};
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Handle describing the installed subscriber.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format chosen by the call that installed the subscriber.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Another subscriber is already installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Builds the event filter described by `config`, frame tracing included.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] if the expression does not parse.
pub fn filter_for(config: &Config) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(config.effective_log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))
}

/// Installs the global subscriber on first use.
///
/// Later calls leave the installed subscriber in place and report the format
/// it was installed with, whatever `config` says.
///
/// # Errors
///
/// Returns a [`TelemetryError`] when the filter is invalid or a foreign
/// subscriber is already installed.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| install_subscriber(config).map(|()| config.log_format()))
        .map(|format| TelemetryHandle { format: *format })
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = filter_for(config)?;

    let ansi = config.log_format().allows_ansi(io::stderr().is_terminal());
    let builder = |events: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(events)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            // Reader, writer and dispatch threads are named per channel.
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(ansi)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn invalid_filters_are_rejected() {
        let config = Config {
            log_filter: "tcf_channel=loud".to_owned(),
            ..Config::default()
        };
        assert!(matches!(filter_for(&config), Err(TelemetryError::Filter(_))));
    }

    #[rstest]
    fn frame_tracing_keeps_the_filter_valid() {
        let config = Config {
            trace_frames: true,
            ..Config::default()
        };
        assert!(filter_for(&config).is_ok());
    }

    #[rstest]
    fn default_filter_parses() {
        assert!(filter_for(&Config::default()).is_ok());
    }
}
