//! Control protocol between the supervisor and a monitor worker process.
//!
//! Transport is the parent/child stdio pipe pair: one JSON document per line,
//! wrapped in a versioned envelope. The channel is reliable and
//! order-preserving within one process pair; there are no retries and no
//! reconnection — a dead worker is only recovered by starting a fresh one.
//!
//! Ordering contract: a worker emits exactly one `Ready` before it accepts
//! any command, and the supervisor never sends `Start` before it has observed
//! `Ready`. After `Start` the worker is expected to eventually emit exactly
//! one of `MonitorStarted`/`MonitorError`, but the supervisor does not wait
//! for it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::keys::Chain;

/// Wire version. Bumped on any incompatible change to the message set.
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent supervisor -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorCommand {
    /// Begin monitoring the given identity. The worker opens its own storage
    /// connection for the key; it never shares the supervisor's.
    Start { identity: String, chain: Chain },
    /// Graceful shutdown request.
    Stop,
}

/// Events sent worker -> supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Handshake: the process is up and will accept commands.
    Ready,
    /// The monitor loop is running for this key.
    MonitorStarted { identity: String, chain: Chain },
    /// Monitor startup or runtime failed.
    MonitorError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    /// The monitor loop stopped cleanly.
    MonitorStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported protocol version {got} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion { got: u32 },
}

#[derive(Serialize, Deserialize)]
struct Envelope<M> {
    v: u32,
    msg: M,
}

/// Serializes a message into one wire line (no trailing newline).
pub fn encode<M: Serialize>(msg: &M) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(&Envelope {
        v: PROTOCOL_VERSION,
        msg,
    })?;
    Ok(line)
}

/// Parses one wire line, checking the envelope version before touching the
/// payload.
pub fn decode<M: DeserializeOwned>(line: &str) -> Result<M, ProtocolError> {
    #[derive(Deserialize)]
    struct VersionOnly {
        v: u32,
    }
    let version: VersionOnly = serde_json::from_str(line)?;
    if version.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion { got: version.v });
    }
    let envelope: Envelope<M> = serde_json::from_str(line)?;
    Ok(envelope.msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_carries_identity_and_chain() {
        let cmd = SupervisorCommand::Start {
            identity: "abc".into(),
            chain: Chain::Main,
        };
        let line = encode(&cmd).unwrap();
        assert!(line.contains("\"v\":1"));
        assert!(line.contains("\"type\":\"start\""));
        assert!(line.contains("\"chain\":\"main\""));
        let back: SupervisorCommand = decode(&line).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn ready_has_no_payload() {
        let line = encode(&WorkerEvent::Ready).unwrap();
        let back: WorkerEvent = decode(&line).unwrap();
        assert_eq!(back, WorkerEvent::Ready);
    }

    #[test]
    fn monitor_error_stack_is_optional() {
        let line = r#"{"v":1,"msg":{"type":"monitor_error","message":"boom"}}"#;
        let event: WorkerEvent = decode(line).unwrap();
        assert_eq!(
            event,
            WorkerEvent::MonitorError {
                message: "boom".into(),
                stack: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let line = r#"{"v":99,"msg":{"type":"ready"}}"#;
        let err = decode::<WorkerEvent>(line).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion { got: 99 }
        ));
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(decode::<WorkerEvent>("not json").is_err());
        assert!(decode::<WorkerEvent>(r#"{"v":1,"msg":{"type":"reboot"}}"#).is_err());
    }
}
