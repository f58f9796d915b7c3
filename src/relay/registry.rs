//! Session Registry
//!
//! Process-wide map of live relay sessions. Every tracked session is in the
//! `Connecting`, `Active` or `Closing` state; the task driving a session
//! removes it exactly once before marking it `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{RelaySession, SessionId, SessionState};

/// Tracks concurrently running relay sessions
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<RelaySession>>>,
    next_id: AtomicU64,
    root: CancellationToken,
    emptied: Notify,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Empty registry whose root token is not cancelled
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
            emptied: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<RelaySession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and track a new `Connecting` session
    pub fn register(&self, ingress_peer: impl Into<String>) -> Arc<RelaySession> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(RelaySession::new(
            id,
            ingress_peer,
            self.root.child_token(),
        ));

        let count = {
            let mut sessions = self.lock();
            sessions.insert(id, Arc::clone(&session));
            sessions.len()
        };

        debug!(session_id = %id, active = count, "Registered session");
        session
    }

    /// Stop tracking a session; returns whether it was still tracked
    pub fn unregister(&self, id: SessionId) -> bool {
        let (removed, now_empty) = {
            let mut sessions = self.lock();
            let removed = sessions.remove(&id).is_some();
            (removed, sessions.is_empty())
        };

        if removed {
            debug!(session_id = %id, "Unregistered session");
            if now_empty {
                self.emptied.notify_waiters();
            }
        } else {
            debug!(session_id = %id, "Session already unregistered");
        }
        removed
    }

    /// Look up a tracked session
    pub fn get(&self, id: SessionId) -> Option<Arc<RelaySession>> {
        self.lock().get(&id).cloned()
    }

    /// Number of sessions not yet unregistered
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids and states of every tracked session
    pub fn snapshot(&self) -> Vec<(SessionId, SessionState)> {
        let mut entries: Vec<_> = self
            .lock()
            .values()
            .map(|session| (session.id, session.state()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Whether `drain` has been called
    pub fn is_draining(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every tracked session and wait until all have unregistered
    ///
    /// Sessions registered after this call start out cancelled.
    pub async fn drain(&self) {
        let pending = self.len();
        info!("Draining {} relay sessions", pending);
        self.root.cancel();

        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                break;
            }
            notified.await;
        }

        info!("All relay sessions drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_allocates_unique_ids() {
        let registry = SessionRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");

        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
        assert_eq!(a.state(), SessionState::Connecting);
        assert!(registry.get(a.id).is_some());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.register("peer");

        assert!(registry.unregister(session.id));
        assert!(!registry.unregister(session.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empty_registry_returns() {
        let registry = SessionRegistry::new();
        registry.drain().await;
        assert!(registry.is_draining());
    }

    #[tokio::test]
    async fn test_drain_cancels_and_waits() {
        let registry = Arc::new(SessionRegistry::new());

        for peer in ["a", "b", "c"] {
            let session = registry.register(peer);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                session.cancel_token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.unregister(session.id);
                session.set_state(SessionState::Closed);
            });
        }

        tokio::time::timeout(Duration::from_secs(5), registry.drain())
            .await
            .unwrap();
        assert!(registry.is_empty());

        let late = registry.register("late");
        assert!(late.is_cancelled());
    }
}
