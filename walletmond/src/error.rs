//! Error taxonomy for the background-services layer.

use walletmon_common::{InvalidKey, StdError};

/// Errors surfaced by the public service operations.
///
/// Stop and teardown paths never produce these: failures there are logged and
/// swallowed so shutdown can't be blocked by a stuck worker or a failed
/// checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed session key or unusable settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Filesystem or schema failure while opening storage. Never cached;
    /// the next call retries from scratch.
    #[error("storage initialization failed: {0}")]
    StorageInit(String),

    /// The forked worker never emitted its ready handshake in time.
    #[error("worker process did not become ready in time")]
    ProcessStartTimeout,

    /// The worker could not be forked, or died before readiness.
    #[error("worker process failed to start: {0}")]
    ProcessStartFailure(String),

    /// Unsupported storage method name.
    #[error("unknown storage method: {0}")]
    MethodNotFound(String),
}

impl ServiceError {
    /// Stable code for the UI boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Configuration(_) => "configuration",
            ServiceError::StorageInit(_) => "storage_init",
            ServiceError::ProcessStartTimeout => "process_start_timeout",
            ServiceError::ProcessStartFailure(_) => "process_start_failure",
            ServiceError::MethodNotFound(_) => "method_not_found",
        }
    }

    pub fn to_std_error(&self) -> StdError {
        StdError::new(self.code(), self.to_string())
    }
}

impl From<InvalidKey> for ServiceError {
    fn from(err: InvalidKey) -> Self {
        ServiceError::Configuration(err.to_string())
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::StorageInit(err.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::StorageInit(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::ProcessStartTimeout.code(), "process_start_timeout");
        assert_eq!(
            ServiceError::MethodNotFound("x".into()).code(),
            "method_not_found"
        );
    }

    #[test]
    fn invalid_key_maps_to_configuration() {
        let err: ServiceError = InvalidKey::EmptyIdentity.into();
        assert_eq!(err.code(), "configuration");
    }
}
