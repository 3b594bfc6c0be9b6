//! Remote shell sessions.
//!
//! A [`Session`] runs commands on one remote shell, one at a time. The
//! [`SessionManager`] opens sessions on demand, lends them to callers and
//! optionally pools one per endpoint.

pub mod manager;
pub mod shell;
pub mod state;

pub use manager::SessionManager;
pub use shell::{CommandResult, Session, SessionError, SessionId};
pub use state::SessionState;
