//! Session lifecycle events and the sink that receives them.
//!
//! The core never formats log lines itself. It emits [`SessionEvent`]s into
//! an injected [`EventSink`]; [`TracingSink`] forwards them to `tracing`
//! with structured fields.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Endpoint;

/// Severity of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Phase of the session lifecycle an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Negotiate,
    Execute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Negotiate => "negotiate",
            Phase::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection attempt started.
    Connecting { session_id: String, endpoint: Endpoint },
    /// Negotiation settled and the session is ready.
    Connected { session_id: String, endpoint: Endpoint },
    /// A command was written to the remote shell.
    CommandStarted {
        session_id: String,
        endpoint: Endpoint,
        command: String,
    },
    /// The prompt was seen after a command.
    CommandCompleted {
        session_id: String,
        endpoint: Endpoint,
        command: String,
        duration: Duration,
        bytes: usize,
    },
    /// The command deadline passed before the prompt was seen.
    CommandTimeout {
        session_id: String,
        endpoint: Endpoint,
        command: String,
        duration: Duration,
        bytes: usize,
    },
    /// The session was closed by its owner.
    SessionClosed { session_id: String, endpoint: Endpoint },
    /// The session hit a fatal error.
    SessionFailed {
        session_id: String,
        endpoint: Endpoint,
        phase: Phase,
        error: String,
    },
}

impl SessionEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connecting { .. } => "connecting",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::CommandStarted { .. } => "command-started",
            SessionEvent::CommandCompleted { .. } => "command-completed",
            SessionEvent::CommandTimeout { .. } => "command-timeout",
            SessionEvent::SessionClosed { .. } => "session-closed",
            SessionEvent::SessionFailed { .. } => "session-failed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SessionEvent::SessionFailed { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Connecting { session_id, .. }
            | SessionEvent::Connected { session_id, .. }
            | SessionEvent::CommandStarted { session_id, .. }
            | SessionEvent::CommandCompleted { session_id, .. }
            | SessionEvent::CommandTimeout { session_id, .. }
            | SessionEvent::SessionClosed { session_id, .. }
            | SessionEvent::SessionFailed { session_id, .. } => session_id,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            SessionEvent::Connecting { endpoint, .. }
            | SessionEvent::Connected { endpoint, .. }
            | SessionEvent::CommandStarted { endpoint, .. }
            | SessionEvent::CommandCompleted { endpoint, .. }
            | SessionEvent::CommandTimeout { endpoint, .. }
            | SessionEvent::SessionClosed { endpoint, .. }
            | SessionEvent::SessionFailed { endpoint, .. } => endpoint,
        }
    }
}

/// Receiver of session events.
///
/// Implementations must be cheap and must not block; events are emitted
/// from inside session operations.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

/// Shared handle to an event sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    /// A shared handle to a tracing sink.
    pub fn shared() -> SharedSink {
        Arc::new(TracingSink)
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &SessionEvent) {
        let details = Details::of(event);

        macro_rules! log {
            ($level:ident) => {
                tracing::$level!(
                    event = event.name(),
                    session_id = event.session_id(),
                    host = event.endpoint().host.as_str(),
                    port = event.endpoint().port,
                    command = details.command,
                    duration_ms = details.duration_ms,
                    bytes = details.bytes,
                    phase = details.phase.map(tracing::field::display),
                    error = details.error,
                    "{}",
                    event
                )
            };
        }

        match event.severity() {
            Severity::Info => log!(info),
            Severity::Error => log!(error),
        }
    }
}

/// Event-specific values, logged as fields only when present.
#[derive(Default)]
struct Details<'a> {
    command: Option<&'a str>,
    duration_ms: Option<u64>,
    bytes: Option<usize>,
    phase: Option<Phase>,
    error: Option<&'a str>,
}

impl<'a> Details<'a> {
    fn of(event: &'a SessionEvent) -> Self {
        match event {
            SessionEvent::CommandStarted { command, .. } => Details {
                command: Some(command.as_str()),
                ..Default::default()
            },
            SessionEvent::CommandCompleted {
                command,
                duration,
                bytes,
                ..
            }
            | SessionEvent::CommandTimeout {
                command,
                duration,
                bytes,
                ..
            } => Details {
                command: Some(command.as_str()),
                duration_ms: Some(duration.as_millis() as u64),
                bytes: Some(*bytes),
                ..Default::default()
            },
            SessionEvent::SessionFailed { phase, error, .. } => Details {
                phase: Some(*phase),
                error: Some(error.as_str()),
                ..Default::default()
            },
            _ => Details::default(),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connecting { endpoint, .. } => write!(f, "Connecting to {}...", endpoint),
            SessionEvent::Connected { endpoint, .. } => write!(f, "Connected to {}", endpoint),
            SessionEvent::CommandStarted { command, .. } => {
                write!(f, "Command started: {}", command)
            }
            SessionEvent::CommandCompleted { duration, bytes, .. } => write!(
                f,
                "Command completed in {}ms ({} bytes)",
                duration.as_millis(),
                bytes
            ),
            SessionEvent::CommandTimeout { duration, .. } => write!(
                f,
                "Command timed out after {}ms before the prompt; returning partial output",
                duration.as_millis()
            ),
            SessionEvent::SessionClosed { .. } => f.write_str("Session closed"),
            SessionEvent::SessionFailed {
                endpoint,
                phase,
                error,
                ..
            } => write!(
                f,
                "Session failed during {} with {}: {}",
                phase, endpoint, error
            ),
        }
    }
}
