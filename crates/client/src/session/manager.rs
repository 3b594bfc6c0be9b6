//! Scoped session acquisition and the per-endpoint session pool.
//!
//! [`SessionManager::with_session`] hands a live session to a closure and
//! guarantees the session is released afterwards. With pooling enabled,
//! at most one session per endpoint is kept open between calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::shell::{Session, SessionError};
use crate::config::{Endpoint, SessionConfig};
use crate::events::SharedSink;

/// One pooled endpoint.
///
/// `turn` serializes callers for the endpoint so they queue instead of
/// seeing `SessionBusy`. `session` is reachable without `turn` so that
/// eviction can interrupt a command in flight.
#[derive(Default)]
struct Slot {
    turn: Mutex<()>,
    session: Mutex<Option<Arc<Session>>>,
}

/// Opens, lends out and closes sessions.
pub struct SessionManager {
    sink: SharedSink,
    pooling: bool,
    pool: Mutex<HashMap<Endpoint, Arc<Slot>>>,
}

impl SessionManager {
    /// Creates a manager. Sessions it opens report to `sink`.
    pub fn new(sink: SharedSink, pooling: bool) -> Self {
        Self {
            sink,
            pooling,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if sessions are kept open between calls.
    pub fn is_pooling(&self) -> bool {
        self.pooling
    }

    /// Run `f` with a live session for `config`'s endpoint.
    ///
    /// Without pooling, a new session is opened for the call and closed on
    /// every exit path, including cancellation of the returned future.
    /// With pooling, a `Ready` session for the endpoint is reused when its
    /// settings match; a session that is not `Ready` after `f` returns is
    /// evicted and closed.
    pub async fn with_session<F, Fut, T>(
        &self,
        config: &SessionConfig,
        f: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        if self.pooling {
            self.with_pooled(config, f).await
        } else {
            self.with_fresh(config, f).await
        }
    }

    async fn with_fresh<F, Fut, T>(&self, config: &SessionConfig, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let session = Arc::new(Session::new(config.clone(), Arc::clone(&self.sink)));
        let guard = CloseGuard::new(Arc::clone(&session));

        if let Err(e) = session.open().await {
            guard.close().await;
            return Err(e);
        }

        let result = f(Arc::clone(&session)).await;
        guard.close().await;
        result
    }

    async fn with_pooled<F, Fut, T>(&self, config: &SessionConfig, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let endpoint = config.endpoint();
        let slot = self.slot(endpoint).await;
        let _turn = slot.turn.lock().await;

        let session = self.checkout(&slot, config).await?;
        let result = f(Arc::clone(&session)).await;

        if !session.is_usable() {
            tracing::debug!(
                session_id = %session.id(),
                endpoint = %endpoint,
                state = %session.state(),
                "Evicting unusable pooled session"
            );
            discard(&slot, &session).await;
        } else if !self.holds(endpoint, &slot).await {
            // Evicted or shut down while `f` was running.
            discard(&slot, &session).await;
        }

        result
    }

    /// Returns the pooled session in `slot`, or opens and stores a new one.
    async fn checkout(
        &self,
        slot: &Slot,
        config: &SessionConfig,
    ) -> Result<Arc<Session>, SessionError> {
        let stale = {
            let mut current = slot.session.lock().await;
            match current.as_ref() {
                Some(session) if session.is_usable() && session.config() == config => {
                    tracing::debug!(
                        session_id = %session.id(),
                        endpoint = %config.endpoint(),
                        "Reusing pooled session"
                    );
                    return Ok(Arc::clone(session));
                }
                _ => current.take(),
            }
        };

        if let Some(stale) = stale {
            tracing::debug!(
                session_id = %stale.id(),
                state = %stale.state(),
                "Replacing pooled session"
            );
            stale.close().await;
        }

        let session = Arc::new(Session::new(config.clone(), Arc::clone(&self.sink)));
        if let Err(e) = session.open().await {
            session.close().await;
            return Err(e);
        }

        *slot.session.lock().await = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn slot(&self, endpoint: &Endpoint) -> Arc<Slot> {
        let mut pool = self.pool.lock().await;
        Arc::clone(pool.entry(endpoint.clone()).or_default())
    }

    /// Returns `true` if `slot` is still the pool's slot for `endpoint`.
    async fn holds(&self, endpoint: &Endpoint, slot: &Arc<Slot>) -> bool {
        self.pool
            .lock()
            .await
            .get(endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Close and forget the pooled session for `endpoint`.
    ///
    /// A command in flight on that session fails with `SessionClosed`.
    /// Returns `true` if a session was pooled.
    pub async fn evict(&self, endpoint: &Endpoint) -> bool {
        let slot = self.pool.lock().await.remove(endpoint);
        let Some(slot) = slot else {
            return false;
        };

        let session = slot.session.lock().await.take();
        match session {
            Some(session) => {
                tracing::debug!(session_id = %session.id(), endpoint = %endpoint, "Evicting pooled session");
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every pooled session. Used at shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.pool.lock().await.drain().collect();

        let mut closed = 0usize;
        for (_, slot) in slots {
            let session = slot.session.lock().await.take();
            if let Some(session) = session {
                session.close().await;
                closed += 1;
            }
        }

        if closed > 0 {
            tracing::info!(count = closed, "Closed pooled sessions");
        }
    }

    /// Number of sessions currently held by the pool.
    pub async fn pooled_count(&self) -> usize {
        let slots: Vec<_> = self.pool.lock().await.values().cloned().collect();

        let mut count = 0;
        for slot in slots {
            if slot.session.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("pooling", &self.pooling)
            .finish_non_exhaustive()
    }
}

/// Remove `session` from `slot` if it is still there, then close it.
async fn discard(slot: &Slot, session: &Arc<Session>) {
    {
        let mut current = slot.session.lock().await;
        if current
            .as_ref()
            .is_some_and(|pooled| Arc::ptr_eq(pooled, session))
        {
            current.take();
        }
    }
    session.close().await;
}

/// Closes a session when dropped without an explicit [`CloseGuard::close`].
struct CloseGuard {
    session: Option<Arc<Session>>,
}

impl CloseGuard {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.close().await });
            }
            Err(_) => {
                tracing::debug!(session_id = %session.id(), "No runtime to close abandoned session");
            }
        }
    }
}
