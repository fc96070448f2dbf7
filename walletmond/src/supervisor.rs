//! Worker process supervision: fork, ready-handshake, start/stop commands,
//! and timeout enforcement, one worker per session key.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use walletmon_common::{protocol, SessionKey, SupervisorCommand, WorkerEvent};

use crate::config::{SupervisorConfig, DATA_DIR_ENV, POLL_INTERVAL_ENV};
use crate::error::ServiceError;
use crate::registry::SessionRegistry;

/// Lifecycle of one supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycleState {
    NotStarted,
    Forking,
    AwaitingReady,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerLifecycleState {
    /// A live worker occupies its key: starting another for the same key is
    /// a no-op. Only terminal states free the key up again.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            WorkerLifecycleState::NotStarted
                | WorkerLifecycleState::Stopped
                | WorkerLifecycleState::Failed
        )
    }
}

/// Owned handle to a forked worker: the child process, its control-channel
/// stdin, and the background task draining its events into the logs.
#[derive(Debug)]
pub struct WorkerHandle {
    pub state: WorkerLifecycleState,
    /// Identifies the start attempt that owns this slot. A finished
    /// handshake installs its handle only if its own token is still there;
    /// a stop may have taken the slot in the meantime.
    token: u64,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    drain: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl WorkerHandle {
    /// Placeholder registered before the fork; holds the key against
    /// concurrent starts.
    fn forking(token: u64) -> Self {
        Self {
            state: WorkerLifecycleState::Forking,
            token,
            child: None,
            stdin: None,
            drain: None,
            pid: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Forks and controls one monitor worker process per session key.
///
/// All registry mutations happen with the check and the write under a single
/// lock acquisition, so two near-simultaneous starts for one key can never
/// fork two processes.
#[derive(Clone)]
pub struct WorkerSupervisor {
    registry: Arc<SessionRegistry>,
    config: Arc<SupervisorConfig>,
    start_tokens: Arc<AtomicU64>,
}

impl WorkerSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<SupervisorConfig>) -> Self {
        Self {
            registry,
            config,
            start_tokens: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts the monitor worker for `key` if none is live.
    ///
    /// Returns once the start command has been written to a ready worker.
    /// The worker's own `MonitorStarted`/`MonitorError` acknowledgment is
    /// observed asynchronously and only logged.
    pub async fn start_worker_session(&self, key: &SessionKey) -> Result<(), ServiceError> {
        let token = self.start_tokens.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.registry.lock().await;
            let session = sessions.get_mut(key).ok_or_else(|| {
                ServiceError::Configuration(format!("no storage session registered for {key}"))
            })?;
            match &session.worker {
                Some(worker) if worker.state.is_live() => {
                    debug!(key = %key, state = ?worker.state, "Worker already live; start is a no-op");
                    return Ok(());
                }
                _ => {}
            }
            // Placeholder goes in before the first await; concurrent starts
            // for this key now observe a live Forking entry and return above.
            session.worker = Some(WorkerHandle::forking(token));
        }

        match self.fork_and_handshake(key, token).await {
            Ok(handle) => {
                let mut sessions = self.registry.lock().await;
                match sessions.get_mut(key) {
                    Some(session)
                        if session
                            .worker
                            .as_ref()
                            .is_some_and(|worker| worker.token == token) =>
                    {
                        info!(key = %key, pid = handle.pid, "Worker session running");
                        session.worker = Some(handle);
                        Ok(())
                    }
                    _ => {
                        // A stop or teardown took our placeholder during the
                        // handshake; the key was released and stays released.
                        drop(sessions);
                        warn!(key = %key, "Worker slot released during startup; stopping fresh worker");
                        kill_quietly(handle).await;
                        Ok(())
                    }
                }
            }
            Err(err) => {
                let mut sessions = self.registry.lock().await;
                if let Some(session) = sessions.get_mut(key) {
                    if session
                        .worker
                        .as_ref()
                        .is_some_and(|worker| worker.token == token)
                    {
                        session.worker = None;
                    }
                }
                warn!(key = %key, error = %err, "Worker session failed to start");
                Err(err)
            }
        }
    }

    /// Stops the worker for `key`, if any. Best-effort: the graceful stop is
    /// bounded by the stop timeout, after which the process is killed. The
    /// worker entry is removed no matter which branch fires, and errors are
    /// logged rather than returned.
    pub async fn stop_worker_session(&self, key: &SessionKey) {
        let mut handle = {
            let mut sessions = self.registry.lock().await;
            let Some(session) = sessions.get_mut(key) else {
                debug!(key = %key, "No session for key; stop is a no-op");
                return;
            };
            match session.worker.take() {
                Some(handle) => handle,
                None => {
                    debug!(key = %key, "No worker for key; stop is a no-op");
                    return;
                }
            }
        };
        handle.state = WorkerLifecycleState::Stopping;
        info!(key = %key, pid = handle.pid, "Stopping worker session");

        if let Some(mut stdin) = handle.stdin.take() {
            match protocol::encode(&SupervisorCommand::Stop) {
                Ok(line) => {
                    if let Err(err) = write_line(&mut stdin, &line).await {
                        warn!(key = %key, error = %err, "Failed to send stop command");
                    }
                }
                Err(err) => warn!(key = %key, error = %err, "Failed to encode stop command"),
            }
            // Dropping our end closes the worker's stdin; EOF doubles as a
            // stop signal if the command never arrived.
            drop(stdin);
        }

        if let Some(mut child) = handle.child.take() {
            match time::timeout(self.config.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    handle.state = WorkerLifecycleState::Stopped;
                    debug!(key = %key, status = %status, "Worker exited");
                }
                Ok(Err(err)) => {
                    warn!(key = %key, error = %err, "Failed to await worker exit");
                }
                Err(_) => {
                    warn!(
                        key = %key,
                        timeout_secs = self.config.stop_timeout.as_secs(),
                        "Worker did not exit in time; killing it"
                    );
                    if let Err(err) = child.start_kill() {
                        warn!(key = %key, error = %err, "Failed to kill worker");
                    }
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(mut drain) = handle.drain.take() {
            if time::timeout(Duration::from_secs(1), &mut drain).await.is_err() {
                drain.abort();
            }
        }
    }

    /// Current lifecycle state of the worker for `key`, if one is registered.
    pub async fn worker_state(&self, key: &SessionKey) -> Option<WorkerLifecycleState> {
        let sessions = self.registry.lock().await;
        sessions
            .get(key)
            .and_then(|session| session.worker.as_ref())
            .map(|worker| worker.state)
    }

    /// OS pid of the live worker for `key`, if any.
    pub async fn worker_pid(&self, key: &SessionKey) -> Option<u32> {
        let sessions = self.registry.lock().await;
        sessions
            .get(key)
            .and_then(|session| session.worker.as_ref())
            .and_then(WorkerHandle::pid)
    }

    async fn fork_and_handshake(
        &self,
        key: &SessionKey,
        token: u64,
    ) -> Result<WorkerHandle, ServiceError> {
        let binary = self.config.resolve_worker_binary().ok_or_else(|| {
            ServiceError::ProcessStartFailure("worker binary not found".into())
        })?;

        let mut command = Command::new(&binary);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.env(DATA_DIR_ENV, &self.config.data_dir);
        command.env(
            POLL_INTERVAL_ENV,
            self.config.poll_interval.as_secs().to_string(),
        );

        debug!(key = %key, binary = %binary.display(), "Forking worker process");
        let mut child = command
            .spawn()
            .map_err(|err| ServiceError::ProcessStartFailure(err.to_string()))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::ProcessStartFailure("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::ProcessStartFailure("worker stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_worker_logs(key.clone(), stderr);
        }

        let mut stdin = BufWriter::new(stdin);
        let mut stdout = BufReader::new(stdout);

        self.set_worker_state(key, token, WorkerLifecycleState::AwaitingReady)
            .await;

        match time::timeout(self.config.ready_timeout, await_ready(key, &mut stdout)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout_secs = self.config.ready_timeout.as_secs(),
                    "Worker never became ready"
                );
                // Best-effort kill; the process may survive it and is no
                // longer tracked afterwards.
                let _ = child.start_kill();
                return Err(ServiceError::ProcessStartTimeout);
            }
        }

        self.set_worker_state(key, token, WorkerLifecycleState::Ready)
            .await;
        debug!(key = %key, pid = pid, "Worker ready; sending start command");

        let start = SupervisorCommand::Start {
            identity: key.identity.clone(),
            chain: key.chain,
        };
        let line = protocol::encode(&start)
            .map_err(|err| ServiceError::ProcessStartFailure(err.to_string()))?;
        if let Err(err) = write_line(&mut stdin, &line).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ServiceError::ProcessStartFailure(err.to_string()));
        }

        let drain = tokio::spawn(drain_worker_events(key.clone(), stdout));

        Ok(WorkerHandle {
            state: WorkerLifecycleState::Running,
            token,
            child: Some(child),
            stdin: Some(stdin),
            drain: Some(drain),
            pid,
        })
    }

    async fn set_worker_state(&self, key: &SessionKey, token: u64, state: WorkerLifecycleState) {
        let mut sessions = self.registry.lock().await;
        if let Some(worker) = sessions.get_mut(key).and_then(|s| s.worker.as_mut()) {
            if worker.token == token {
                worker.state = state;
            }
        }
    }
}

/// Reads lines until the ready handshake arrives. Exhausting the stream means
/// the worker died before readiness.
async fn await_ready(
    key: &SessionKey,
    stdout: &mut BufReader<ChildStdout>,
) -> Result<(), ServiceError> {
    loop {
        let mut line = String::new();
        let bytes_read = stdout
            .read_line(&mut line)
            .await
            .map_err(|err| ServiceError::ProcessStartFailure(err.to_string()))?;
        if bytes_read == 0 {
            return Err(ServiceError::ProcessStartFailure(
                "worker exited before becoming ready".into(),
            ));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match protocol::decode::<WorkerEvent>(trimmed) {
            Ok(WorkerEvent::Ready) => return Ok(()),
            Ok(WorkerEvent::MonitorError { message, .. }) => {
                return Err(ServiceError::ProcessStartFailure(message));
            }
            Ok(event) => {
                warn!(key = %key, event = ?event, "Unexpected worker event before ready");
            }
            Err(err) => {
                warn!(key = %key, line = trimmed, error = %err, "Undecodable line during handshake");
            }
        }
    }
}

async fn write_line(
    stdin: &mut BufWriter<ChildStdin>,
    line: &str,
) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Drains post-start worker events. These acknowledge monitor startup and
/// shutdown; they are logged, never awaited by callers.
async fn drain_worker_events(key: SessionKey, mut stdout: BufReader<ChildStdout>) {
    loop {
        let mut line = String::new();
        match stdout.read_line(&mut line).await {
            Ok(0) => {
                debug!(key = %key, "Worker event stream closed");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to read worker event");
                return;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match protocol::decode::<WorkerEvent>(trimmed) {
            Ok(WorkerEvent::MonitorStarted { identity, chain }) => {
                info!(key = %key, identity = %identity, chain = %chain, "Monitor started");
            }
            Ok(WorkerEvent::MonitorError { message, stack }) => {
                warn!(key = %key, message = %message, stack = ?stack, "Monitor reported an error");
            }
            Ok(WorkerEvent::MonitorStopped) => {
                info!(key = %key, "Monitor stopped");
            }
            Ok(WorkerEvent::Ready) => {
                warn!(key = %key, "Duplicate ready handshake ignored");
            }
            Err(err) => {
                warn!(key = %key, line = trimmed, error = %err, "Undecodable worker event");
            }
        }
    }
}

/// Forwards the worker's stderr into our logs; the stream carries log lines
/// only, never control messages.
fn forward_worker_logs(key: SessionKey, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        debug!(key = %key, "worker: {}", trimmed);
                    }
                }
            }
        }
    });
}

async fn kill_quietly(mut handle: WorkerHandle) {
    if let Some(mut child) = handle.child.take() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    if let Some(drain) = handle.drain.take() {
        drain.abort();
    }
}
