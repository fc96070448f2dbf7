//! Shared types for the wallet background services: session keys, the
//! supervisor/worker control protocol, and the response wrapper handed to the
//! UI shell.

pub mod keys;
pub mod protocol;
pub mod response;

pub use keys::{Chain, InvalidKey, SessionKey};
pub use protocol::{ProtocolError, SupervisorCommand, WorkerEvent, PROTOCOL_VERSION};
pub use response::{StdError, StdResponse};

/// Application namespace used for data directories and schema registration.
pub const APP_NAME: &str = "walletmon";
