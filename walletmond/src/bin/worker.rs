//! Monitor worker entry point.
//!
//! Launched by the supervisor with no command-line arguments: configuration
//! arrives through the environment, control through stdin/stdout. Exits 0 on
//! graceful stop and non-zero on unrecoverable startup failure.

use tracing::error;
use tracing_subscriber::EnvFilter;

use walletmon_common::{protocol, WorkerEvent};
use walletmond::worker::{self, HeartbeatMonitor, WorkerSettings};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout is reserved for the control channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WALLETMON_WORKER_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = match WorkerSettings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "Worker misconfigured");
            report_startup_failure(&err);
            std::process::exit(1);
        }
    };

    if let Err(err) = worker::run(settings, HeartbeatMonitor::factory()).await {
        error!(error = %err, "Worker failed");
        std::process::exit(1);
    }
}

/// Startup failed before the control loop could report it; emit the error
/// event directly so the supervisor sees more than a dead pipe.
fn report_startup_failure(err: &anyhow::Error) {
    let event = WorkerEvent::MonitorError {
        message: err.to_string(),
        stack: Some(format!("{err:?}")),
    };
    if let Ok(line) = protocol::encode(&event) {
        println!("{line}");
    }
}
