//! Process-wide table of active sessions.
//!
//! The registry is the server's in-memory record of every connected client.
//! Sessions are inserted after a successful handshake and removed on
//! disconnect.  Aggregate counts are kept in atomics beside the map so the
//! health channel can read them without taking the lock.
//!
//! # Active-job gauge
//!
//! The registry also owns the count of jobs currently in flight.  Admitting a
//! job takes an [`ActiveJobSlot`]; the slot decrements the gauge exactly once,
//! either when the job reaches a terminal state or when the slot is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use lipsync_core::SessionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A freshly generated id collided with a live session.
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
}

/// What the registry knows about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts for the health channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub active_jobs: usize,
}

/// In-memory registry of connected sessions.
///
/// Shared by `Arc` between the accept loop and every connection task.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
    session_count: AtomicUsize,
    active_jobs: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateSession`] if the id is already present; the
    /// existing entry is left untouched.
    pub async fn register(&self, info: SessionInfo) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&info.id) {
            return Err(RegistryError::DuplicateSession(info.id));
        }
        sessions.insert(info.id, info);
        self.session_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes a session.  Returns `false` if it was not registered, so a
    /// second call for the same id never decrements the count again.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            self.session_count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Snapshot of all sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.sessions.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Current counts.  Lock-free.
    pub fn snapshot_stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.session_count.load(Ordering::Acquire),
            active_jobs: self.active_jobs.load(Ordering::Acquire),
        }
    }

    /// Counts one more job in flight until the returned slot is released.
    pub fn begin_job(&self) -> ActiveJobSlot {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        ActiveJobSlot {
            gauge: Arc::clone(&self.active_jobs),
            released: false,
        }
    }
}

/// One unit of the active-job gauge.
#[derive(Debug)]
pub struct ActiveJobSlot {
    gauge: Arc<AtomicUsize>,
    released: bool,
}

impl ActiveJobSlot {
    /// Decrements the gauge.  Further calls do nothing.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.gauge.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for ActiveJobSlot {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            id: SessionId::new_v4(),
            peer: Some("127.0.0.1:5000".parse().unwrap()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        // Arrange
        let registry = SessionRegistry::new();
        let session = info();

        // Act
        registry.register(session.clone()).await.unwrap();

        // Assert
        assert_eq!(registry.get(session.id).await, Some(session));
        assert_eq!(registry.snapshot_stats().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_duplicate_register_is_rejected() {
        let registry = SessionRegistry::new();
        let session = info();
        registry.register(session.clone()).await.unwrap();

        let result = registry.register(session.clone()).await;

        assert_eq!(result, Err(RegistryError::DuplicateSession(session.id)));
        assert_eq!(registry.snapshot_stats().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_unregister_twice_decrements_once() {
        // Arrange
        let registry = SessionRegistry::new();
        let session = info();
        registry.register(session.clone()).await.unwrap();

        // Act
        let first = registry.unregister(session.id).await;
        let second = registry.unregister(session.id).await;

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(registry.snapshot_stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_list_returns_every_session() {
        let registry = SessionRegistry::new();
        for _ in 0..3 {
            registry.register(info()).await.unwrap();
        }
        assert_eq!(registry.list().await.len(), 3);
    }

    #[test]
    fn test_job_slot_releases_exactly_once() {
        // Arrange
        let registry = SessionRegistry::new();
        let mut slot = registry.begin_job();
        assert_eq!(registry.snapshot_stats().active_jobs, 1);

        // Act
        slot.release();
        slot.release();
        drop(slot);

        // Assert
        assert_eq!(registry.snapshot_stats().active_jobs, 0);
    }

    #[test]
    fn test_stats_count_sessions_and_jobs_independently() {
        // Arrange
        let registry = SessionRegistry::new();
        let session = info();
        tokio_test::block_on(registry.register(session.clone())).unwrap();

        // Act
        let _job = registry.begin_job();
        let during = registry.snapshot_stats();
        tokio_test::block_on(registry.unregister(session.id));

        // Assert
        assert_eq!(during, RegistryStats { active_sessions: 1, active_jobs: 1 });
        assert_eq!(
            registry.snapshot_stats(),
            RegistryStats { active_sessions: 0, active_jobs: 1 }
        );
    }

    #[test]
    fn test_dropped_job_slot_releases() {
        let registry = SessionRegistry::new();
        {
            let _a = registry.begin_job();
            let _b = registry.begin_job();
            assert_eq!(registry.snapshot_stats().active_jobs, 2);
        }
        assert_eq!(registry.snapshot_stats().active_jobs, 0);
    }
}
