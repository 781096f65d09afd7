//! Session Registry
//!
//! Numeric session ids with last-activity timestamps. The lock sweep uses
//! the registry to detect orphaned locks: a lock whose session has expired
//! or logged out is implicitly rolled back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::ident::SessionId;

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Instant>,
    next_id: AtomicU64,
    max_idle: Duration,
}

impl SessionRegistry {
    pub fn new(max_idle: Duration) -> Self {
        SessionRegistry {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_idle,
        }
    }

    pub fn create(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, Instant::now());
        debug!(session = id, "session created");
        id
    }

    /// Refresh the session's activity timestamp.
    pub fn touch(&self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut entry) => {
                *entry = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn terminate(&self, id: SessionId) {
        self.sessions.remove(&id);
        debug!(session = id, "session terminated");
    }

    /// A session is active while it exists and has not idled out.
    pub fn is_active(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|last| last.elapsed() <= self.max_idle)
    }

    /// Drop idle sessions, returning how many were removed.
    pub fn expire_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, last| last.elapsed() <= self.max_idle);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_touch_terminate() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let id = registry.create();
        assert!(registry.is_active(id));
        assert!(registry.touch(id));
        registry.terminate(id);
        assert!(!registry.is_active(id));
        assert!(!registry.touch(id));
    }

    #[test]
    fn test_idle_expiry() {
        let registry = SessionRegistry::new(Duration::from_millis(10));
        let id = registry.create();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!registry.is_active(id));
        assert_eq!(registry.expire_idle(), 1);
        assert!(registry.is_empty());
    }
}
