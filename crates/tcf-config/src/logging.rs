//! Log output settings for processes hosting channels.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Filter directive that surfaces per-frame records from channel I/O.
///
/// Channels log every frame they read or write at `trace` level under this
/// target, so appending the directive is enough to watch the wire without
/// raising verbosity elsewhere.
pub const FRAME_TRACE_DIRECTIVE: &str = "tcf_channel::channel=trace";

/// Shape of the records written by the telemetry subscriber.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per record with the channel, token and service fields
    /// flattened to the top level.
    #[default]
    Json,
    /// Single-line text for watching a session from a terminal.
    Compact,
}

impl LogFormat {
    /// Whether records may carry ANSI colour when stderr is a terminal.
    #[must_use]
    pub const fn allows_ansi(self, terminal: bool) -> bool {
        match self {
            Self::Json => false,
            Self::Compact => terminal,
        }
    }
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;

/// Joins `filter` with the frame trace directive when `trace_frames` is set.
#[must_use]
pub fn filter_with_frames(filter: &str, trace_frames: bool) -> String {
    match (trace_frames, filter.trim()) {
        (false, _) => filter.to_owned(),
        (true, "") => FRAME_TRACE_DIRECTIVE.to_owned(),
        (true, base) => format!("{base},{FRAME_TRACE_DIRECTIVE}"),
    }
}
