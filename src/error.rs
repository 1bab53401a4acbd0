//! Error types for the status board and its workers

use std::fmt;
use std::time::Duration;

/// Result type alias for board operations
pub type BoardResult<T> = Result<T, BoardError>;

/// Errors that can occur while handling reports, commands and channel traffic
#[derive(Debug)]
pub enum BoardError {
    /// Malformed or incomplete protocol input
    Protocol(String),

    /// A color name that is not recognized
    UnknownColor(String),

    /// A privileged command from a sender that is not allowed to issue it
    Unauthorized { sender: String, command: String },

    /// A report for a host that is not configured (ghost)
    GhostHost(String),

    /// No log record for the given host/test
    NotFound(String),

    /// An acknowledgement referencing a cookie that is not live
    UnknownCookie(u32),

    /// The readers of a channel did not consume the previous message in time
    ChannelTimeout {
        channel: &'static str,
        waited: Duration,
    },

    /// The other end of a channel is gone
    ChannelClosed(&'static str),

    /// The input exceeded the configured size limit
    Oversized { limit: usize },

    /// A checkpoint record could not be parsed
    Checkpoint(String),

    /// Invalid configuration (rules file, regex, durations, ...)
    Config(String),

    /// I/O error (sockets, pipes, files)
    Io(std::io::Error),
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::Protocol(msg) => write!(f, "malformed input: {msg}"),
            BoardError::UnknownColor(name) => write!(f, "unknown color '{name}'"),
            BoardError::Unauthorized { sender, command } => {
                write!(f, "sender {sender} is not allowed to issue '{command}'")
            }
            BoardError::GhostHost(host) => write!(f, "report for unknown host '{host}'"),
            BoardError::NotFound(what) => write!(f, "no such record: {what}"),
            BoardError::UnknownCookie(cookie) => write!(f, "cookie {cookie} is not active"),
            BoardError::ChannelTimeout { channel, waited } => write!(
                f,
                "readers of channel '{channel}' did not finish within {}ms",
                waited.as_millis()
            ),
            BoardError::ChannelClosed(channel) => write!(f, "channel '{channel}' is closed"),
            BoardError::Oversized { limit } => {
                write!(f, "input exceeds the limit of {limit} bytes")
            }
            BoardError::Checkpoint(msg) => write!(f, "bad checkpoint record: {msg}"),
            BoardError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            BoardError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for BoardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BoardError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BoardError {
    fn from(err: std::io::Error) -> Self {
        BoardError::Io(err)
    }
}

impl From<regex::Error> for BoardError {
    fn from(err: regex::Error) -> Self {
        BoardError::Config(err.to_string())
    }
}
