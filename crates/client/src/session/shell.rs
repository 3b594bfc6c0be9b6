//! Remote shell session.
//!
//! A session owns one [`Transport`] and one [`Framer`] and drives the
//! lifecycle described by [`SessionState`]. Commands are strictly
//! serialized: while one is in flight, further calls to
//! [`Session::execute`] are rejected with [`SessionError::SessionBusy`]
//! rather than queued.

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use protocol::{FrameEvent, Framer, ResponseCollector};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::SessionState;
use crate::config::{Endpoint, SessionConfig};
use crate::events::{Phase, SessionEvent, SharedSink};
use crate::transport::{Transport, TransportError};

/// Bytes of greeting kept while looking for the first prompt.
const BANNER_TAIL: usize = 4096;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The connect attempt did not finish before the deadline.
    #[error("connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: Endpoint, timeout_ms: u64 },

    /// The connect attempt failed.
    #[error("connection to {endpoint} refused: {reason}")]
    ConnectRefused { endpoint: Endpoint, reason: String },

    /// The transport failed; the session is now `Failed`.
    #[error("connection to {0} lost")]
    ConnectionLost(Endpoint),

    /// Another command is in flight.
    #[error("session is busy with another command")]
    SessionBusy,

    /// The session cannot execute commands in its current state.
    #[error("session is not ready (state: {0})")]
    SessionNotReady(SessionState),

    /// The session was closed, possibly while the call was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The command cannot be sent as a single line.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl SessionError {
    /// Returns `true` for errors that leave the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectTimeout { .. }
                | SessionError::ConnectRefused { .. }
                | SessionError::ConnectionLost(_)
                | SessionError::SessionClosed
        )
    }
}

/// Outcome of one executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// The command line as given.
    pub command: String,
    /// Output with the echoed command and the prompt removed.
    #[serde(serialize_with = "serialize_lossy")]
    pub output: Vec<u8>,
    /// Time from write to prompt (or deadline).
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// `true` if the deadline passed before the prompt was seen.
    pub truncated: bool,
}

impl CommandResult {
    /// Output decoded as UTF-8, with invalid sequences replaced.
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A command-execution session with one remote shell.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// Validated settings.
    config: SessionConfig,

    /// Receiver of lifecycle events.
    sink: SharedSink,

    /// Current state. Transitions are check-and-set under the channel lock.
    state: watch::Sender<SessionState>,

    /// Set once by `open`; never replaced.
    transport: OnceLock<Transport>,

    /// Decoder state, held for the duration of negotiation or a command.
    framer: Mutex<Framer>,

    /// Cancelled by `close` to abort in-flight work.
    closing: CancellationToken,

    /// Output of an earlier command may still be on its way, so the next
    /// command only trusts what follows its own echo.
    desynced: AtomicBool,
}

impl Session {
    /// Creates a session in the `Disconnected` state.
    pub fn new(config: SessionConfig, sink: SharedSink) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            sink,
            state,
            transport: OnceLock::new(),
            framer: Mutex::new(Framer::new()),
            closing: CancellationToken::new(),
            desynced: AtomicBool::new(false),
        }
    }

    /// Creates a session and opens it.
    pub async fn connect(config: SessionConfig, sink: SharedSink) -> Result<Self, SessionError> {
        let session = Self::new(config, sink);
        session.open().await?;
        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the remote endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        self.config.endpoint()
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns `true` if a command can be executed right now.
    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Connect and negotiate, moving from `Disconnected` to `Ready`.
    ///
    /// Bounded by the connect timeout plus the negotiation grace window.
    pub async fn open(&self) -> Result<(), SessionError> {
        let limit =
            Instant::now() + self.config.connect_timeout() + self.config.negotiation_grace();
        self.transition(SessionState::Disconnected, SessionState::Connecting)
            .map_err(SessionError::SessionNotReady)?;
        self.emit(SessionEvent::Connecting {
            session_id: self.id.clone(),
            endpoint: self.endpoint().clone(),
        });

        let opened = tokio::select! {
            result = Transport::open(self.endpoint(), self.config.connect_timeout()) => result,
            _ = self.closing.cancelled() => return Err(SessionError::SessionClosed),
        };

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                let err = connect_error(e, self.endpoint());
                self.fail(Phase::Connect, &err).await;
                return Err(err);
            }
        };

        if let Err(transport) = self.transport.set(transport) {
            transport.close().await;
            return Err(SessionError::SessionNotReady(self.state()));
        }

        // A close that raced the connect has already moved us out of
        // Connecting; the transport it could not see is released here.
        if self
            .transition(SessionState::Connecting, SessionState::Negotiating)
            .is_err()
        {
            self.release_transport().await;
            return Err(SessionError::SessionClosed);
        }

        self.negotiate(limit).await?;

        self.transition(SessionState::Negotiating, SessionState::Ready)
            .map_err(|_| SessionError::SessionClosed)?;
        self.emit(SessionEvent::Connected {
            session_id: self.id.clone(),
            endpoint: self.endpoint().clone(),
        });
        Ok(())
    }

    /// Decline option requests and wait for the shell to settle at its
    /// prompt. Data seen here (banner, first prompt) is dropped.
    async fn negotiate(&self, limit: Instant) -> Result<(), SessionError> {
        let transport = self.transport()?;
        let mut framer = self.framer.lock().await;

        let at_prompt = self
            .unless_closed(Phase::Negotiate, self.settle(transport, &mut framer, limit))
            .await?;
        if !at_prompt {
            tracing::warn!(
                session_id = %self.id,
                prompt = %self.config.prompt(),
                "Greeting did not end with the prompt; first command will wait for its echo"
            );
        }
        self.desynced.store(!at_prompt, Ordering::Release);
        Ok(())
    }

    /// Run one command and collect its output.
    ///
    /// The session returns to `Ready` whether the prompt was seen or the
    /// command deadline passed; in the latter case the result is marked
    /// `truncated`. A transport failure moves the session to `Failed` and
    /// yields [`SessionError::ConnectionLost`].
    pub async fn execute(&self, command: &str) -> Result<CommandResult, SessionError> {
        let wire = protocol::encode_command(command.as_bytes())
            .map_err(|e| SessionError::InvalidCommand(e.to_string()))?;

        self.begin_command()?;
        let mut busy = BusyGuard {
            session: self,
            write: LineWrite::Pending,
        };
        let transport = self.transport()?;

        self.emit(SessionEvent::CommandStarted {
            session_id: self.id.clone(),
            endpoint: self.endpoint().clone(),
            command: command.to_string(),
        });

        let started = Instant::now();
        let deadline = started + self.config.command_timeout();
        let prompt = self.config.prompt().clone();
        let mut collector = if self.desynced.load(Ordering::Acquire) {
            ResponseCollector::after_echo(command, prompt)
        } else {
            ResponseCollector::new(command, prompt)
        };
        let mut framer = self.framer.lock().await;

        self.unless_closed(
            Phase::Execute,
            self.discard_stale(transport, &mut framer, deadline),
        )
        .await?;

        busy.write = LineWrite::InFlight;
        let send = async {
            tokio::time::timeout_at(deadline.into(), transport.send(&wire))
                .await
                .unwrap_or(Err(TransportError::TransportClosed))
        };
        self.unless_closed(Phase::Execute, send).await?;
        busy.write = LineWrite::Done;
        self.desynced.store(true, Ordering::Release);

        self.unless_closed(
            Phase::Execute,
            self.collect(transport, &mut framer, &mut collector, deadline),
        )
        .await?;
        if collector.is_complete() {
            self.desynced.store(false, Ordering::Release);
        }

        let duration = started.elapsed();
        let bytes = collector.len();
        let response = collector.finish();
        let truncated = !response.complete;

        if truncated {
            self.emit(SessionEvent::CommandTimeout {
                session_id: self.id.clone(),
                endpoint: self.endpoint().clone(),
                command: command.to_string(),
                duration,
                bytes,
            });
        } else {
            self.emit(SessionEvent::CommandCompleted {
                session_id: self.id.clone(),
                endpoint: self.endpoint().clone(),
                command: command.to_string(),
                duration,
                bytes,
            });
        }

        Ok(CommandResult {
            command: command.to_string(),
            output: response.output,
            duration,
            truncated,
        })
    }

    /// Close the session.
    ///
    /// Any in-flight command fails with [`SessionError::SessionClosed`].
    /// Safe to call repeatedly and from another task than the one running
    /// `execute`. A `Failed` session stays `Failed`.
    pub async fn close(&self) {
        let mut previous = SessionState::Disconnected;
        self.state.send_if_modified(|state| {
            previous = *state;
            if state.is_terminal() || state.is_closing() {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });

        self.closing.cancel();
        self.release_transport().await;

        if previous.is_terminal() || previous.is_closing() {
            return;
        }

        self.state.send_replace(SessionState::Closed);
        self.emit(SessionEvent::SessionClosed {
            session_id: self.id.clone(),
            endpoint: self.endpoint().clone(),
        });
    }

    fn begin_command(&self) -> Result<(), SessionError> {
        self.transition(SessionState::Ready, SessionState::Busy)
            .map_err(|state| match state {
                SessionState::Busy => SessionError::SessionBusy,
                other => SessionError::SessionNotReady(other),
            })
    }

    /// Run `work` unless `close` is called first. A transport failure
    /// fails the session.
    async fn unless_closed<T>(
        &self,
        phase: Phase,
        work: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, SessionError> {
        let outcome = tokio::select! {
            result = work => result,
            _ = self.closing.cancelled() => return Err(SessionError::SessionClosed),
        };
        match outcome {
            Ok(value) => Ok(value),
            Err(_) => Err(self.lose_connection(phase).await),
        }
    }

    /// A shell that sends nothing within the grace window is taken to be
    /// waiting for input. Once data shows up, reading goes on until the
    /// prompt ends it or `limit` passes.
    ///
    /// Returns `false` if data arrived but no prompt followed it.
    async fn settle(
        &self,
        transport: &Transport,
        framer: &mut Framer,
        limit: Instant,
    ) -> Result<bool, TransportError> {
        let mut deadline = (Instant::now() + self.config.negotiation_grace()).min(limit);
        let mut banner: Vec<u8> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(banner.is_empty());
            }
            let chunk = transport.receive(remaining).await?;
            if chunk.is_empty() {
                return Ok(banner.is_empty());
            }
            let events = framer.decode(&chunk);
            self.answer_negotiation(transport, &events).await?;

            for event in &events {
                if let FrameEvent::Data(data) = event {
                    banner.extend_from_slice(data);
                }
            }
            if banner.is_empty() {
                continue;
            }
            deadline = limit;
            if banner.len() > BANNER_TAIL {
                banner.drain(..banner.len() - BANNER_TAIL);
            }
            if self.config.prompt().find_at_end(&banner).is_some() {
                return Ok(true);
            }
        }
    }

    /// Read until the prompt, the size cap or the deadline.
    async fn collect(
        &self,
        transport: &Transport,
        framer: &mut Framer,
        collector: &mut ResponseCollector,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || collector.is_full() {
                return Ok(());
            }
            let chunk = transport.receive(remaining).await?;
            if chunk.is_empty() {
                return Ok(());
            }
            let events = framer.decode(&chunk);
            self.answer_negotiation(transport, &events).await?;
            for event in &events {
                if let FrameEvent::Data(data) = event {
                    collector.push(data);
                }
            }
            if collector.is_complete() {
                return Ok(());
            }
        }
    }

    /// Drop output that arrived while no command was running.
    async fn discard_stale(
        &self,
        transport: &Transport,
        framer: &mut Framer,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        while Instant::now() < deadline {
            let chunk = transport.receive(Duration::ZERO).await?;
            if chunk.is_empty() {
                break;
            }
            let events = framer.decode(&chunk);
            self.answer_negotiation(transport, &events).await?;
            tracing::trace!(
                session_id = %self.id,
                bytes = chunk.len(),
                "Discarded stale output"
            );
        }
        Ok(())
    }

    async fn answer_negotiation(
        &self,
        transport: &Transport,
        events: &[FrameEvent],
    ) -> Result<(), TransportError> {
        let reply = protocol::refusals(events);
        if reply.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            session_id = %self.id,
            bytes = reply.len(),
            "Declining option negotiation"
        );
        transport.send(&reply).await
    }

    fn transport(&self) -> Result<&Transport, SessionError> {
        self.transport
            .get()
            .ok_or_else(|| SessionError::SessionNotReady(self.state()))
    }

    async fn release_transport(&self) {
        if let Some(transport) = self.transport.get() {
            transport.close().await;
        }
    }

    /// Atomically move from `from` to `to`. On mismatch returns the actual state.
    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        let mut actual = from;
        let changed = self.state.send_if_modified(|state| {
            actual = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(actual)
        }
    }

    /// Map a transport failure to the error the caller should see.
    async fn lose_connection(&self, phase: Phase) -> SessionError {
        if self.closing.is_cancelled() {
            return SessionError::SessionClosed;
        }
        let err = SessionError::ConnectionLost(self.endpoint().clone());
        self.fail(phase, &err).await;
        err
    }

    /// Move to `Failed` (unless already closing or terminal) and release the transport.
    async fn fail(&self, phase: Phase, error: &SessionError) {
        let failed = self.state.send_if_modified(|state| {
            if state.is_terminal() || state.is_closing() {
                false
            } else {
                *state = SessionState::Failed;
                true
            }
        });
        self.release_transport().await;

        if failed {
            self.emit(SessionEvent::SessionFailed {
                session_id: self.id.clone(),
                endpoint: self.endpoint().clone(),
                phase,
                error: error.to_string(),
            });
        }
    }

    /// Fail a session whose command line was only partly written. The
    /// transport stays open until `close`.
    fn abandon_partial_line(&self) {
        if self
            .transition(SessionState::Busy, SessionState::Failed)
            .is_ok()
        {
            self.emit(SessionEvent::SessionFailed {
                session_id: self.id.clone(),
                endpoint: self.endpoint().clone(),
                phase: Phase::Execute,
                error: "command line only partly written".to_string(),
            });
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.sink.emit(&event);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

/// How far the command line got onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineWrite {
    Pending,
    InFlight,
    Done,
}

/// Releases `Busy` when an execute call ends, including when its future
/// is dropped mid-flight. A line cut off mid-write leaves the remote
/// shell with half a command, so the session fails instead.
struct BusyGuard<'a> {
    session: &'a Session,
    write: LineWrite,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.write == LineWrite::InFlight {
            self.session.abandon_partial_line();
        } else {
            let _ = self
                .session
                .transition(SessionState::Busy, SessionState::Ready);
        }
    }
}

fn connect_error(err: TransportError, endpoint: &Endpoint) -> SessionError {
    match err {
        TransportError::ConnectTimeout {
            endpoint,
            timeout_ms,
        } => SessionError::ConnectTimeout {
            endpoint,
            timeout_ms,
        },
        TransportError::ConnectRefused { endpoint, reason } => {
            SessionError::ConnectRefused { endpoint, reason }
        }
        TransportError::TransportClosed => SessionError::ConnectionLost(endpoint.clone()),
    }
}
