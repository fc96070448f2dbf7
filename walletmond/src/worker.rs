//! Worker-side state machine for the monitor process.
//!
//! The worker is forked by the supervisor with no command-line arguments; all
//! control flows over stdin/stdout as versioned JSON lines, while stderr
//! carries log output only. It emits exactly one `Ready` on launch, starts
//! monitoring on `Start` (with its own storage connection, never the
//! supervisor's), and stops gracefully on `Stop`, SIGTERM, or stdin EOF.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::{debug, info, warn};

use walletmon_common::{protocol, Chain, SessionKey, SupervisorCommand, WorkerEvent};

use crate::config::{DATA_DIR_ENV, POLL_INTERVAL_ENV};
use crate::storage::{open_wal_connection, ConnectionFactory, StorageHandle};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Continuous monitoring logic. The real wallet engine (UTXO scanning, fee
/// watching) plugs in here; the supervisor treats it as opaque.
#[async_trait]
pub trait MonitorEngine: Send {
    /// One monitoring pass. Errors are logged by the loop; they do not stop
    /// monitoring.
    async fn tick(&mut self) -> Result<()>;
}

/// Engine factory chosen at the composition root (the worker binary).
pub type MonitorEngineFactory =
    Box<dyn Fn(SessionKey, StorageHandle) -> Result<Box<dyn MonitorEngine>> + Send>;

/// Default engine: records a heartbeat event per pass so monitor liveness is
/// visible in storage.
pub struct HeartbeatMonitor {
    storage: StorageHandle,
}

impl HeartbeatMonitor {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    pub fn factory() -> MonitorEngineFactory {
        Box::new(|_key, storage| Ok(Box::new(HeartbeatMonitor::new(storage))))
    }
}

#[async_trait]
impl MonitorEngine for HeartbeatMonitor {
    async fn tick(&mut self) -> Result<()> {
        self.storage
            .record_event("heartbeat", None)
            .await
            .map_err(|err| anyhow!(err))
    }
}

/// Worker process settings, resolved from the environment set by the
/// supervisor at fork time.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup(DATA_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("{DATA_DIR_ENV} not set"))?;
        let poll_interval = lookup(POLL_INTERVAL_ENV)
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
        Ok(Self {
            data_dir,
            poll_interval,
        })
    }
}

struct RunningMonitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs the worker until a stop condition. Returns an error only on
/// unrecoverable startup failure, in which case `MonitorError` has been
/// emitted and no `MonitorStopped` will follow; the binary exits non-zero.
pub async fn run(settings: WorkerSettings, engines: MonitorEngineFactory) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    emit(&mut stdout, &WorkerEvent::Ready).await?;
    debug!("Worker ready; awaiting commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    let mut monitor: Option<RunningMonitor> = None;

    loop {
        #[cfg(unix)]
        let stop_signal = sigterm.recv();
        #[cfg(not(unix))]
        let stop_signal = std::future::pending::<Option<()>>();

        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match protocol::decode::<SupervisorCommand>(trimmed) {
                            Ok(SupervisorCommand::Start { identity, chain }) => {
                                if monitor.is_some() {
                                    warn!("Start command while already monitoring; ignored");
                                    continue;
                                }
                                match start_monitor(&settings, &engines, identity, chain).await {
                                    Ok((running, key)) => {
                                        monitor = Some(running);
                                        emit(&mut stdout, &WorkerEvent::MonitorStarted {
                                            identity: key.identity.clone(),
                                            chain: key.chain,
                                        })
                                        .await?;
                                        info!(key = %key, "Monitoring started");
                                    }
                                    Err(err) => {
                                        emit(&mut stdout, &WorkerEvent::MonitorError {
                                            message: err.to_string(),
                                            stack: Some(format!("{err:?}")),
                                        })
                                        .await?;
                                        return Err(err);
                                    }
                                }
                            }
                            Ok(SupervisorCommand::Stop) => {
                                debug!("Stop command received");
                                break;
                            }
                            Err(err) => {
                                warn!(line = trimmed, error = %err, "Undecodable command ignored");
                            }
                        }
                    }
                    // Supervisor gone; treat a closed pipe as a stop request.
                    Ok(None) => {
                        debug!("Control channel closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to read control channel");
                        break;
                    }
                }
            }
            _ = stop_signal => {
                debug!("Termination signal received");
                break;
            }
        }
    }

    if let Some(running) = monitor.take() {
        let _ = running.shutdown.send(true);
        if time::timeout(Duration::from_secs(2), running.task).await.is_err() {
            warn!("Monitor loop did not wind down in time");
        }
    }
    emit(&mut stdout, &WorkerEvent::MonitorStopped).await?;
    info!("Worker stopped");
    Ok(())
}

async fn start_monitor(
    settings: &WorkerSettings,
    engines: &MonitorEngineFactory,
    identity: String,
    chain: Chain,
) -> Result<(RunningMonitor, SessionKey)> {
    let key = SessionKey::new(identity, chain).context("invalid session key in start command")?;

    // Independent connection to the shared database file; WAL mode keeps it
    // compatible with the supervisor's own handle.
    let open_key = key.clone();
    let data_dir = settings.data_dir.clone();
    let storage = task::spawn_blocking(move || {
        let connections: ConnectionFactory = Arc::new(open_wal_connection);
        StorageHandle::open_blocking(&open_key, &data_dir, &connections)
    })
    .await
    .context("storage open task panicked")?
    .context("failed to open worker storage")?;

    let mut engine = engines(key.clone(), storage).context("failed to build monitor engine")?;
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let interval = settings.poll_interval;
    let loop_key = key.clone();

    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = engine.tick().await {
                        warn!(key = %loop_key, error = %err, "Monitor pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(key = %loop_key, "Monitor loop stopping");
                    return;
                }
            }
        }
    });

    Ok((RunningMonitor { shutdown, task }, key))
}

async fn emit(stdout: &mut Stdout, event: &WorkerEvent) -> Result<()> {
    let line = protocol::encode(event).context("failed to encode worker event")?;
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use rusqlite::Connection;

    #[tokio::test]
    async fn heartbeat_monitor_records_events() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new("abc", Chain::Test).unwrap();
        let connections: ConnectionFactory = Arc::new(open_wal_connection);
        let storage = StorageHandle::open_blocking(&key, dir.path(), &connections).unwrap();

        let mut engine = HeartbeatMonitor::new(storage);
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        let conn = Connection::open(dir.path().join(Chain::Test.db_file_name())).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM monitor_events WHERE identity = 'abc' AND kind = 'heartbeat'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn settings_default_the_poll_interval() {
        // Missing interval variable falls back to the default.
        let settings = WorkerSettings::from_lookup(|name| {
            (name == DATA_DIR_ENV).then(|| "/tmp/walletmon-test".to_string())
        })
        .unwrap();
        assert_eq!(
            settings.poll_interval,
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
        );
    }

    #[test]
    fn settings_require_the_data_dir() {
        assert!(WorkerSettings::from_lookup(|_| None).is_err());
    }

    #[test]
    fn settings_ignore_unparseable_poll_intervals() {
        let settings = WorkerSettings::from_lookup(|name| match name {
            DATA_DIR_ENV => Some("/tmp/walletmon-test".to_string()),
            POLL_INTERVAL_ENV => Some("soon".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(
            settings.poll_interval,
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
        );
    }
}
