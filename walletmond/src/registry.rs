//! The shared session registry: one entry per (identity, chain) key, tying
//! the storage handle and the optional worker handle together.
//!
//! This is the only shared mutable structure in the service layer. Every
//! idempotency check and every mutation goes through its single mutex; the
//! supervisor's check-then-insert of a forking placeholder happens while the
//! guard is held, with no await in between.

use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use walletmon_common::SessionKey;

use crate::storage::StorageHandle;
use crate::supervisor::WorkerHandle;

/// The pairing of a storage handle and an optional supervised worker for one
/// key. Storage always exists before a worker is forked; a worker may be
/// stopped and restarted without touching storage.
#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub storage: StorageHandle,
    pub worker: Option<WorkerHandle>,
}

impl Session {
    pub fn new(key: SessionKey, storage: StorageHandle) -> Self {
        Self {
            key,
            storage,
            worker: None,
        }
    }
}

/// Keyed map of live sessions with an explicit construction point. Teardown
/// is wired by the host application's shutdown hooks, not by global state.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<SessionKey, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the session map. Callers must not hold the guard
    /// across an await when performing idempotency-sensitive updates — the
    /// per-key guarantees rest on check and mutation sharing one
    /// acquisition.
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Session>> {
        self.inner.lock().await
    }

    /// Snapshot of all registered keys.
    pub async fn keys(&self) -> Vec<SessionKey> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn storage(&self, key: &SessionKey) -> Option<StorageHandle> {
        self.inner
            .lock()
            .await
            .get(key)
            .map(|session| session.storage.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Removes and returns every session. Used by full teardown after all
    /// workers have been stopped.
    pub async fn drain(&self) -> Vec<Session> {
        let mut sessions = self.inner.lock().await;
        sessions.drain().map(|(_, session)| session).collect()
    }

    /// Removes one session entirely (storage and any worker handle).
    pub async fn remove(&self, key: &SessionKey) -> Option<Session> {
        self.inner.lock().await.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use walletmon_common::Chain;

    use crate::storage::{open_wal_connection, ConnectionFactory, StorageHandle};

    fn session_for(dir: &std::path::Path, identity: &str) -> Session {
        let key = SessionKey::new(identity, Chain::Test).unwrap();
        let connections: ConnectionFactory = Arc::new(open_wal_connection);
        let storage = StorageHandle::open_blocking(&key, dir, &connections).unwrap();
        Session::new(key, storage)
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        for identity in ["a", "b", "c"] {
            let session = session_for(dir.path(), identity);
            registry.lock().await.insert(session.key.clone(), session);
        }
        assert_eq!(registry.len().await, 3);

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty().await);

        // Draining again is a no-op.
        assert!(registry.drain().await.is_empty());
    }

    #[tokio::test]
    async fn storage_lookup_is_none_for_unknown_keys() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("ghost", Chain::Main).unwrap();
        assert!(registry.storage(&key).await.is_none());
    }
}
