//! Session lifecycle states.

use std::fmt;

/// State of a session.
///
/// ```text
/// Disconnected ─open─▶ Connecting ─▶ Negotiating ─▶ Ready ◀─▶ Busy
///                          │              │           │        │
///                          ▼              ▼           ▼        ▼
///                        Failed         Failed      Closing ─▶ Closed
/// ```
///
/// `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet opened.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Connected, waiting for option negotiation to settle.
    Negotiating,
    /// Idle and able to execute a command.
    Ready,
    /// A command is in flight.
    Busy,
    /// Close in progress.
    Closing,
    /// Closed by its owner.
    Closed,
    /// Stopped by a fatal error.
    Failed,
}

impl SessionState {
    /// Returns `true` for states a session never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Returns `true` once a close has started or finished.
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
