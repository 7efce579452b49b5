//! Error types for the realtime store client.

use std::fmt;
use std::time::Duration;

use crate::transport::TransportError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced to callers of store operations.
///
/// Network, protocol and cache failures are recovered inside the session
/// (logged, reported on the bus, retried via reconnect). Only failures tied to
/// a caller-initiated operation reach the caller: local validation,
/// acknowledgement timeouts, and a `connect` that can no longer succeed.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid argument provided by caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Update on a version-controlled table without a numeric `version`.
    #[error(
        "table '{table}' is version-controlled: update requires a numeric `version` field; \
         read the current record, take its `version` and send `version + 1`"
    )]
    MissingVersion { table: String },

    /// No acknowledgement arrived within the request window.
    #[error("request {request_id} timed out after {after:?} without acknowledgement")]
    Timeout { request_id: String, after: Duration },

    /// The connection attempt failed and no reconnect is scheduled.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session was closed before the operation could complete.
    #[error("session closed")]
    Closed,
}

impl SyncError {
    /// Returns true if this is an acknowledgement timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }

    /// Returns true if this is a local validation failure (raised before any
    /// network activity).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidArgument(_) | SyncError::MissingVersion { .. }
        )
    }

    /// Returns true if this is a connection or transport error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Closed)
    }
}

/// Classification tags attached to error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure (connect refused, abrupt close, socket error).
    WsError,
    /// Inbound message could not be decoded.
    ParseError,
    /// Outbound message could not be delivered.
    SendError,
    /// A bus subscriber failed.
    HandlerError,
    /// Cache adapter failure.
    CacheError,
}

impl ErrorKind {
    /// Wire-style tag for this classification.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::WsError => "ws-error",
            ErrorKind::ParseError => "parse-error",
            ErrorKind::SendError => "send-error",
            ErrorKind::HandlerError => "handler-error",
            ErrorKind::CacheError => "cache-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
