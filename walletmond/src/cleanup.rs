//! Full teardown of the session registry on application shutdown.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::registry::SessionRegistry;
use crate::supervisor::WorkerSupervisor;

/// Drains the registry: stops every worker, closes every storage handle,
/// leaves the registry empty. Wired into the host application's shutdown
/// hooks, which may fire more than once; repeated calls are no-ops.
pub struct CleanupCoordinator {
    registry: Arc<SessionRegistry>,
    supervisor: WorkerSupervisor,
}

impl CleanupCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, supervisor: WorkerSupervisor) -> Self {
        Self {
            registry,
            supervisor,
        }
    }

    /// Stops all workers in parallel, then closes all storage handles in
    /// parallel. Individual failures are logged by the callees and never
    /// block the rest; shutdown always completes.
    pub async fn teardown_all(&self) {
        let keys = self.registry.keys().await;
        if keys.is_empty() {
            debug!("Teardown on empty registry; nothing to do");
            return;
        }
        info!(sessions = keys.len(), "Tearing down all sessions");

        join_all(
            keys.iter()
                .map(|key| self.supervisor.stop_worker_session(key)),
        )
        .await;

        let sessions = self.registry.drain().await;
        join_all(sessions.iter().map(|session| session.storage.close())).await;

        info!("Teardown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use walletmon_common::{Chain, SessionKey};

    use crate::config::SupervisorConfig;
    use crate::storage::{open_wal_connection, StorageSessionFactory};

    fn coordinator_for(
        dir: &std::path::Path,
    ) -> (Arc<SessionRegistry>, StorageSessionFactory, CleanupCoordinator) {
        let registry = Arc::new(SessionRegistry::new());
        let factory = StorageSessionFactory::new(
            Arc::clone(&registry),
            dir.to_path_buf(),
            Arc::new(open_wal_connection),
        );
        let supervisor = WorkerSupervisor::new(
            Arc::clone(&registry),
            Arc::new(SupervisorConfig::default()),
        );
        let cleanup = CleanupCoordinator::new(Arc::clone(&registry), supervisor);
        (registry, factory, cleanup)
    }

    #[tokio::test]
    async fn teardown_empties_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, factory, cleanup) = coordinator_for(dir.path());

        for identity in ["a", "b", "c"] {
            let key = SessionKey::new(identity, Chain::Test).unwrap();
            factory.get_or_create(&key).await.unwrap();
        }
        assert_eq!(registry.len().await, 3);

        cleanup.teardown_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, factory, cleanup) = coordinator_for(dir.path());

        let key = SessionKey::new("abc", Chain::Main).unwrap();
        factory.get_or_create(&key).await.unwrap();

        cleanup.teardown_all().await;
        cleanup.teardown_all().await;
        assert!(registry.is_empty().await);

        // Sessions can be created again after a teardown.
        factory.get_or_create(&key).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }
}
