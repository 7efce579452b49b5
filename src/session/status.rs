//! Session lifecycle status.

use std::fmt;

/// Lifecycle of one [`SyncSession`](super::SyncSession).
///
/// `idle -> connecting -> open -> ready -> closed`, with
/// `open|ready -> closed -> connecting` forming the reconnect loop. `error`
/// marks a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Ready,
    Closed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Open => "open",
            SessionStatus::Ready => "ready",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        }
    }

    /// Whether frames can be written to the transport.
    pub fn is_writable(&self) -> bool {
        matches!(self, SessionStatus::Open | SessionStatus::Ready)
    }

    /// Whether the transport is confirmed down.
    pub fn is_down(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
