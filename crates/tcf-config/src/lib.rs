//! Shared configuration for the channel runtime and the tools built on it.
//!
//! [`Config`] derives its loader from `ortho_config`. Precedence from lowest
//! to highest: compiled defaults, a TOML file (`--config-path` or
//! `TCF_CONFIG_PATH`, otherwise `.tcf.toml` discovery), `TCF_*` environment
//! variables, then command-line flags such as `--max-message-size`.
//! Embedding applications that already own a configuration story can
//! deserialize [`Config`] directly from their own sources instead.

mod defaults;
mod endpoint;
mod logging;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_INBOUND_BACKLOG_LIMIT, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_MESSAGE_SIZE, default_connect_timeout_ms, default_inbound_backlog_limit,
    default_log_filter, default_log_filter_string, default_log_format, default_max_message_size,
    default_trace_frames,
};
pub use endpoint::{EndpointParseError, PeerEndpoint};
pub use logging::{FRAME_TRACE_DIRECTIVE, LogFormat, LogFormatParseError, filter_with_frames};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "TCF_";

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "TCF_CONFIG_PATH";

/// Top-level configuration consumed by the runtime and telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[serde(default)]
#[ortho_config(prefix = "TCF")]
pub struct Config {
    /// `tracing` filter expression, e.g. `info,tcf_channel::locator=debug`.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format for log records.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Adds [`FRAME_TRACE_DIRECTIVE`] to the log filter.
    #[ortho_config(default = default_trace_frames())]
    pub trace_frames: bool,
    /// Largest frame body accepted from a peer, in bytes.
    #[ortho_config(default = default_max_message_size())]
    pub max_message_size: usize,
    /// Undispatched inbound frames tolerated before congestion is advertised.
    #[ortho_config(default = default_inbound_backlog_limit())]
    pub inbound_backlog_limit: usize,
    /// Timeout for establishing socket transports, in milliseconds.
    #[ortho_config(default = default_connect_timeout_ms())]
    pub connect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            trace_frames: default_trace_frames(),
            max_message_size: default_max_message_size(),
            inbound_backlog_limit: default_inbound_backlog_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Config {
    /// Returns the configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Returns the filter telemetry should install, frame tracing included.
    #[must_use]
    pub fn effective_log_filter(&self) -> String {
        filter_with_frames(&self.log_filter, self.trace_frames)
    }

    /// Returns the configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Returns the limits applied to channels.
    #[must_use]
    pub const fn channel(&self) -> ChannelSettings {
        ChannelSettings {
            max_message_size: self.max_message_size,
            inbound_backlog_limit: self.inbound_backlog_limit,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }
}

/// Limits applied to every channel opened by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Largest frame body accepted from a peer, in bytes.
    pub max_message_size: usize,
    /// Undispatched inbound frames tolerated before congestion is advertised.
    pub inbound_backlog_limit: usize,
    /// Timeout for establishing socket transports, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Config::default().channel()
    }
}

impl ChannelSettings {
    /// Connection timeout as a [`std::time::Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}
