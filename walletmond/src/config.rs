//! Supervisor configuration.
//!
//! Loaded leniently from an optional TOML file: a missing or unparseable file
//! logs a warning and falls back to defaults, so the wallet shell always gets
//! a working service layer.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use walletmon_common::APP_NAME;

const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Environment variable the supervisor sets on spawned workers so both sides
/// resolve the same data directory.
pub const DATA_DIR_ENV: &str = "WALLETMON_DATA_DIR";

/// Environment variable carrying the monitor heartbeat interval to workers.
pub const POLL_INTERVAL_ENV: &str = "WALLETMON_POLL_INTERVAL_SECS";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding the per-chain database files.
    pub data_dir: PathBuf,
    /// Worker binary override. When unset the supervisor looks for
    /// `walletmon-worker` next to the current executable.
    pub worker_binary: Option<PathBuf>,
    /// How long a freshly forked worker may take to emit its ready handshake.
    pub ready_timeout: Duration,
    /// How long a stopping worker may take to exit before it is killed.
    pub stop_timeout: Duration,
    /// Monitor loop heartbeat interval, passed to workers.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker_binary: None,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    data_dir: Option<String>,
    #[serde(default)]
    worker_binary: Option<String>,
    #[serde(default)]
    ready_timeout_secs: Option<u64>,
    #[serde(default)]
    stop_timeout_secs: Option<u64>,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
}

impl SupervisorConfig {
    /// Loads configuration from `path`, falling back to defaults for missing
    /// or invalid entries.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::default();
        let Some(path) = path else {
            return config;
        };

        let contents = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return config;
            }
        };

        let parsed: ConfigFile = match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                return config;
            }
        };

        if let Some(dir) = parsed.data_dir {
            config.data_dir = PathBuf::from(expand_home(&dir));
        }
        if let Some(binary) = parsed.worker_binary {
            config.worker_binary = Some(PathBuf::from(expand_home(&binary)));
        }
        if let Some(secs) = parsed.ready_timeout_secs.filter(|s| *s > 0) {
            config.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed.stop_timeout_secs.filter(|s| *s > 0) {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed.poll_interval_secs.filter(|s| *s > 0) {
            config.poll_interval = Duration::from_secs(secs);
        }
        config
    }

    /// Resolves the worker binary: the configured override, else a sibling of
    /// the current executable.
    pub fn resolve_worker_binary(&self) -> Option<PathBuf> {
        if let Some(ref binary) = self.worker_binary {
            return Some(binary.clone());
        }
        let exe = env::current_exe().ok()?;
        let candidate = exe.parent()?.join("walletmon-worker");
        candidate.is_file().then_some(candidate)
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(format!(".{APP_NAME}"));
    }
    env::temp_dir().join(APP_NAME)
}

fn expand_home(raw: &str) -> String {
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return format!("{}/{}", home, stripped);
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = SupervisorConfig::default();
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert!(config.worker_binary.is_none());
    }

    #[test]
    fn worker_binary_override_wins() {
        let config = SupervisorConfig {
            worker_binary: Some(PathBuf::from("/opt/walletmon/worker")),
            ..SupervisorConfig::default()
        };
        // The override is returned as-is, no sibling lookup involved.
        assert_eq!(
            config.resolve_worker_binary(),
            Some(PathBuf::from("/opt/walletmon/worker"))
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = SupervisorConfig::load(Some(Path::new("/nonexistent/walletmon.toml")));
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
    }

    #[test]
    fn loads_overrides_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walletmon.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "data_dir = \"/var/lib/walletmon\"\nready_timeout_secs = 3\nstop_timeout_secs = 2"
        )
        .unwrap();

        let config = SupervisorConfig::load(Some(&path));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/walletmon"));
        assert_eq!(config.ready_timeout, Duration::from_secs(3));
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        // Untouched fields keep their defaults.
        assert_eq!(config.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn zero_timeouts_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walletmon.toml");
        std::fs::write(&path, "ready_timeout_secs = 0").unwrap();
        let config = SupervisorConfig::load(Some(&path));
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
    }
}
