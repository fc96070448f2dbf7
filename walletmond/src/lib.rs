//! Background services for the wallet shell: per-identity storage sessions
//! and supervised monitor worker processes.
//!
//! The shell talks to [`WalletServices`], the composition root. It owns the
//! single [`SessionRegistry`] and wires the storage factory, the worker
//! supervisor, and the cleanup coordinator around it. `teardown_all` is meant
//! to be called from the application's shutdown hooks.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

use serde_json::Value;

use walletmon_common::{Chain, SessionKey, StdResponse};

pub use cleanup::CleanupCoordinator;
pub use config::SupervisorConfig;
pub use error::ServiceError;
pub use registry::{Session, SessionRegistry};
pub use storage::{open_wal_connection, ConnectionFactory, StorageSessionFactory};
pub use supervisor::{WorkerLifecycleState, WorkerSupervisor};

/// Caller-facing service layer: one storage session and at most one monitor
/// worker per (identity, chain) key.
pub struct WalletServices {
    registry: Arc<SessionRegistry>,
    factory: StorageSessionFactory,
    supervisor: WorkerSupervisor,
    cleanup: CleanupCoordinator,
}

impl WalletServices {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_connection_factory(config, Arc::new(open_wal_connection))
    }

    /// Builds the service layer with an explicit database connection factory.
    /// The factory is chosen once, here; nothing else decides how
    /// connections open.
    pub fn with_connection_factory(
        config: SupervisorConfig,
        connections: ConnectionFactory,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let config = Arc::new(config);
        let factory = StorageSessionFactory::new(
            Arc::clone(&registry),
            config.data_dir.clone(),
            connections,
        );
        let supervisor = WorkerSupervisor::new(Arc::clone(&registry), Arc::clone(&config));
        let cleanup = CleanupCoordinator::new(Arc::clone(&registry), supervisor.clone());
        Self {
            registry,
            factory,
            supervisor,
            cleanup,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Ensures storage exists for the identity. `Ok(true)` on success; never
    /// `Ok(false)` — failure is always an error.
    pub async fn is_available(&self, identity: &str, chain: Chain) -> Result<bool, ServiceError> {
        let key = SessionKey::new(identity, chain)?;
        self.factory.is_available(&key).await
    }

    /// Ensures storage exists and returns the identity's persisted settings
    /// as one JSON object.
    pub async fn make_available(
        &self,
        identity: &str,
        chain: Chain,
    ) -> Result<Value, ServiceError> {
        let key = SessionKey::new(identity, chain)?;
        self.factory.settings_snapshot(&key).await
    }

    /// Ensures storage exists, then idempotently starts the monitor worker
    /// for the key.
    pub async fn initialize_services(
        &self,
        identity: &str,
        chain: Chain,
    ) -> Result<(), ServiceError> {
        let key = SessionKey::new(identity, chain)?;
        self.factory.get_or_create(&key).await?;
        self.supervisor.start_worker_session(&key).await
    }

    /// Dispatches a named storage operation for the identity.
    pub async fn call_method(
        &self,
        identity: &str,
        chain: Chain,
        name: &str,
        args: Value,
    ) -> Result<Value, ServiceError> {
        let key = SessionKey::new(identity, chain)?;
        self.factory.call_method(&key, name, args).await
    }

    /// Per-key teardown: stops the worker (best-effort), closes storage, and
    /// forgets the session. Never fails.
    pub async fn stop_services(&self, identity: &str, chain: Chain) -> Result<(), ServiceError> {
        let key = SessionKey::new(identity, chain)?;
        self.supervisor.stop_worker_session(&key).await;
        if let Some(session) = self.registry.remove(&key).await {
            session.storage.close().await;
        }
        Ok(())
    }

    /// Full teardown of every session. Safe to call repeatedly.
    pub async fn teardown_all(&self) {
        self.cleanup.teardown_all().await;
    }

    // Response-wrapped variants for the UI boundary: a success flag plus a
    // structured error instead of a bare Result.

    pub async fn is_available_response(&self, identity: &str, chain: Chain) -> StdResponse<bool> {
        respond(self.is_available(identity, chain).await)
    }

    pub async fn make_available_response(
        &self,
        identity: &str,
        chain: Chain,
    ) -> StdResponse<Value> {
        respond(self.make_available(identity, chain).await)
    }

    pub async fn initialize_services_response(
        &self,
        identity: &str,
        chain: Chain,
    ) -> StdResponse<()> {
        respond(self.initialize_services(identity, chain).await)
    }

    pub async fn call_method_response(
        &self,
        identity: &str,
        chain: Chain,
        name: &str,
        args: Value,
    ) -> StdResponse<Value> {
        respond(self.call_method(identity, chain, name, args).await)
    }
}

fn respond<T>(result: Result<T, ServiceError>) -> StdResponse<T> {
    match result {
        Ok(data) => StdResponse::success(data),
        Err(err) => StdResponse::error(err.to_std_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn services_in(dir: &std::path::Path) -> WalletServices {
        let config = SupervisorConfig {
            data_dir: dir.to_path_buf(),
            ..SupervisorConfig::default()
        };
        WalletServices::new(config)
    }

    #[tokio::test]
    async fn make_available_returns_a_settings_object() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_in(dir.path());

        let settings = services.make_available("abc", Chain::Main).await.unwrap();
        assert_eq!(settings, json!({}));

        services
            .call_method("abc", Chain::Main, "put_setting", json!({"key": "lang", "value": "en"}))
            .await
            .unwrap();
        let settings = services.make_available("abc", Chain::Main).await.unwrap();
        assert_eq!(settings, json!({"lang": "en"}));
    }

    #[tokio::test]
    async fn invalid_identity_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_in(dir.path());
        let err = services.is_available("", Chain::Main).await.unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[tokio::test]
    async fn responses_carry_error_codes_for_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_in(dir.path());

        let ok = services.is_available_response("abc", Chain::Test).await;
        assert!(ok.success);
        assert_eq!(ok.data, Some(true));

        let bad = services
            .call_method_response("abc", Chain::Test, "no_such_method", json!({}))
            .await;
        assert!(!bad.success);
        assert_eq!(bad.error.unwrap().code, "method_not_found");
    }

    #[tokio::test]
    async fn stop_services_forgets_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_in(dir.path());

        services.make_available("abc", Chain::Main).await.unwrap();
        assert_eq!(services.registry().len().await, 1);

        services.stop_services("abc", Chain::Main).await.unwrap();
        assert!(services.registry().is_empty().await);

        // Stopping again is a no-op.
        services.stop_services("abc", Chain::Main).await.unwrap();
    }
}
