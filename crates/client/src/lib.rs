//! # telbridge
//!
//! Runs commands on remote line-oriented shells (TELNET-style, typically
//! embedded devices) and returns their output.
//!
//! ## Overview
//!
//! - **Transport**: deadline-bounded TCP byte stream with idempotent close
//! - **Session**: connect, decline option negotiation, then execute
//!   commands one at a time, detecting completion by the shell prompt
//! - **Session manager**: scoped acquisition with guaranteed close and an
//!   optional pool of one session per endpoint
//! - **Events**: lifecycle events delivered to an injected sink
//!
//! ```text
//! caller ─▶ SessionManager ─▶ Session::execute ─▶ Framer ─▶ Transport
//!                                   ▲                          │
//!                                   └── prompt detection ◀─────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::config::ConnectionArgs;
//! use client::events::TracingSink;
//! use client::session::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectionArgs::new("192.168.1.1").validate()?;
//!     let manager = SessionManager::new(TracingSink::shared(), false);
//!
//!     let result = manager
//!         .with_session(&config, |session| async move { session.execute("uname -a").await })
//!         .await?;
//!     println!("{}", result.output_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Connection arguments, validation and the TOML config file
//! - [`events`]: Session events and sinks
//! - [`session`]: Session state machine and manager
//! - [`transport`]: TCP transport

pub mod config;
pub mod events;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError, ConfigViolation, ConnectionArgs, Endpoint, SessionConfig};
pub use events::{EventSink, Phase, SessionEvent, Severity, SharedSink, TracingSink};
pub use session::{
    CommandResult, Session, SessionError, SessionId, SessionManager, SessionState,
};
pub use transport::{Transport, TransportError};
