//! Default values shared by the configuration model and its serde layer.

use crate::logging::LogFormat;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Largest frame body accepted from a peer, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Number of undispatched inbound frames tolerated before the channel
/// advertises congestion to the remote peer.
pub const DEFAULT_INBOUND_BACKLOG_LIMIT: usize = 256;

/// Connection timeout used when opening socket transports, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default log filter expression.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default maximum frame size.
#[must_use]
pub const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Default inbound backlog limit.
#[must_use]
pub const fn default_inbound_backlog_limit() -> usize {
    DEFAULT_INBOUND_BACKLOG_LIMIT
}

/// Default connection timeout.
#[must_use]
pub const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Frame tracing is off unless requested.
#[must_use]
pub const fn default_trace_frames() -> bool {
    false
}
