//! Storage sessions: one SQLite connection per (identity, chain) key.
//!
//! Each chain has a single database file under the data directory; rows are
//! scoped by identity. Connections are opened in WAL mode so the supervisor
//! and a monitor worker can each hold their own connection to the same file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tokio::task;
use tracing::{debug, info, warn};

use walletmon_common::{SessionKey, APP_NAME};

use crate::error::ServiceError;
use crate::registry::{Session, SessionRegistry};

/// Schema version recorded in `schema_info`.
const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_info (
    app         TEXT NOT NULL,
    version     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (app, version)
);

CREATE TABLE IF NOT EXISTS settings (
    identity    TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (identity, key)
);

CREATE TABLE IF NOT EXISTS sync_state (
    identity    TEXT PRIMARY KEY,
    last_height INTEGER NOT NULL DEFAULT 0,
    last_hash   TEXT,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitor_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    detail      TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_monitor_events_identity
    ON monitor_events(identity);
"#;

/// Opens a connection configured for concurrent access from more than one
/// process: WAL journal plus a busy timeout instead of immediate lock errors.
pub fn open_wal_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Connection factory chosen once at the composition root.
pub type ConnectionFactory =
    Arc<dyn Fn(&Path) -> rusqlite::Result<Connection> + Send + Sync>;

/// The closed set of storage operations callers may invoke by name.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageCall {
    GetSetting { key: String },
    PutSetting { key: String, value: Value },
    ListSettings,
    SyncStatus,
    RecordSyncProgress { height: i64, hash: Option<String> },
}

impl StorageCall {
    /// Maps a method name plus JSON arguments onto the closed call set.
    /// Unknown names are `MethodNotFound`; recognized names with bad
    /// arguments are configuration errors.
    pub fn parse(name: &str, args: Value) -> Result<Self, ServiceError> {
        fn str_arg(args: &Value, field: &str) -> Result<String, ServiceError> {
            args.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ServiceError::Configuration(format!("missing string argument '{field}'"))
                })
        }

        match name {
            "get_setting" => Ok(StorageCall::GetSetting {
                key: str_arg(&args, "key")?,
            }),
            "put_setting" => Ok(StorageCall::PutSetting {
                key: str_arg(&args, "key")?,
                value: args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| {
                        ServiceError::Configuration("missing argument 'value'".into())
                    })?,
            }),
            "list_settings" => Ok(StorageCall::ListSettings),
            "sync_status" => Ok(StorageCall::SyncStatus),
            "record_sync_progress" => {
                let height = args.get("height").and_then(Value::as_i64).ok_or_else(|| {
                    ServiceError::Configuration("missing integer argument 'height'".into())
                })?;
                let hash = args
                    .get("hash")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(StorageCall::RecordSyncProgress { height, hash })
            }
            other => Err(ServiceError::MethodNotFound(other.to_string())),
        }
    }
}

/// One open storage connection scoped to a session key.
///
/// Cheap to clone; all clones share the same underlying connection. Blocking
/// SQLite work runs on the blocking pool.
#[derive(Clone)]
pub struct StorageHandle {
    key: SessionKey,
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish()
    }
}

impl StorageHandle {
    /// Opens the connection and runs idempotent schema setup keyed by
    /// (chain, application, identity). Blocking; callers wrap it in
    /// `spawn_blocking`.
    pub fn open_blocking(
        key: &SessionKey,
        data_dir: &Path,
        connections: &ConnectionFactory,
    ) -> Result<Self, ServiceError> {
        let path = data_dir.join(key.chain.db_file_name());
        let conn = connections(&path)
            .map_err(|err| ServiceError::StorageInit(err.to_string()))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|err| ServiceError::StorageInit(err.to_string()))?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO schema_info (app, version, created_at) VALUES (?1, ?2, ?3)",
            params![APP_NAME, SCHEMA_VERSION, now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_state (identity, last_height, updated_at) VALUES (?1, 0, ?2)",
            params![key.identity, now],
        )?;

        debug!(key = %key, path = %path.display(), "Opened storage session");
        Ok(Self {
            key: key.clone(),
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Executes one storage call on the blocking pool.
    pub async fn call(&self, call: StorageCall) -> Result<Value, ServiceError> {
        let handle = self.clone();
        task::spawn_blocking(move || handle.call_blocking(call))
            .await
            .map_err(|err| ServiceError::StorageInit(format!("storage task panicked: {err}")))?
    }

    pub fn call_blocking(&self, call: StorageCall) -> Result<Value, ServiceError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ServiceError::StorageInit("storage connection poisoned".into()))?;
        let identity = &self.key.identity;
        let now = Utc::now().to_rfc3339();

        match call {
            StorageCall::GetSetting { key } => {
                let value: Option<String> = conn
                    .query_row(
                        "SELECT value FROM settings WHERE identity = ?1 AND key = ?2",
                        params![identity, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                match value {
                    Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
                    None => Ok(Value::Null),
                }
            }
            StorageCall::PutSetting { key, value } => {
                let raw = serde_json::to_string(&value).map_err(|err| {
                    ServiceError::Configuration(format!("unserializable setting value: {err}"))
                })?;
                conn.execute(
                    "INSERT INTO settings (identity, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(identity, key) DO UPDATE SET value = ?3, updated_at = ?4",
                    params![identity, key, raw, now],
                )?;
                Ok(Value::Null)
            }
            StorageCall::ListSettings => {
                let mut stmt = conn
                    .prepare("SELECT key, value FROM settings WHERE identity = ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![identity], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut map = serde_json::Map::new();
                for row in rows {
                    let (key, raw) = row?;
                    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            StorageCall::SyncStatus => {
                let row = conn
                    .query_row(
                        "SELECT last_height, last_hash, updated_at FROM sync_state WHERE identity = ?1",
                        params![identity],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                match row {
                    Some((height, hash, updated_at)) => Ok(json!({
                        "last_height": height,
                        "last_hash": hash,
                        "updated_at": updated_at,
                    })),
                    None => Ok(Value::Null),
                }
            }
            StorageCall::RecordSyncProgress { height, hash } => {
                conn.execute(
                    "INSERT INTO sync_state (identity, last_height, last_hash, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(identity) DO UPDATE SET last_height = ?2, last_hash = ?3, updated_at = ?4",
                    params![identity, height, hash, now],
                )?;
                conn.execute(
                    "INSERT INTO monitor_events (identity, kind, detail, created_at) VALUES (?1, 'sync_progress', ?2, ?3)",
                    params![identity, height.to_string(), now],
                )?;
                Ok(Value::Null)
            }
        }
    }

    /// Appends one entry to the monitor event journal.
    pub async fn record_event(
        &self,
        kind: &str,
        detail: Option<String>,
    ) -> Result<(), ServiceError> {
        let handle = self.clone();
        let kind = kind.to_string();
        task::spawn_blocking(move || {
            let conn = handle
                .conn
                .lock()
                .map_err(|_| ServiceError::StorageInit("storage connection poisoned".into()))?;
            conn.execute(
                "INSERT INTO monitor_events (identity, kind, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![handle.key.identity, kind, detail, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|err| ServiceError::StorageInit(format!("storage task panicked: {err}")))?
    }

    /// Flushes the WAL back into the main file. Errors are logged, not
    /// returned: close runs on shutdown paths that must not fail.
    pub async fn close(&self) {
        let handle = self.clone();
        let result = task::spawn_blocking(move || {
            let conn = handle
                .conn
                .lock()
                .map_err(|_| "storage connection poisoned".to_string())?;
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(|err| err.to_string())
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(key = %self.key, "Storage session closed"),
            Ok(Err(err)) => warn!(key = %self.key, error = %err, "Storage checkpoint failed"),
            Err(err) => warn!(key = %self.key, error = %err, "Storage close task failed"),
        }
    }
}

/// Lazily creates and caches one storage handle per session key.
pub struct StorageSessionFactory {
    registry: Arc<SessionRegistry>,
    data_dir: PathBuf,
    connections: ConnectionFactory,
}

impl StorageSessionFactory {
    pub fn new(
        registry: Arc<SessionRegistry>,
        data_dir: PathBuf,
        connections: ConnectionFactory,
    ) -> Self {
        Self {
            registry,
            data_dir,
            connections,
        }
    }

    /// Returns the cached handle for `key`, creating it on first use.
    ///
    /// Creation runs under the registry lock, so schema setup executes once
    /// per key even under concurrent callers. Failures leave no cache entry
    /// behind; the next call retries from scratch.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<StorageHandle, ServiceError> {
        let mut sessions = self.registry.lock().await;
        if let Some(session) = sessions.get(key) {
            return Ok(session.storage.clone());
        }

        tokio::fs::create_dir_all(&self.data_dir).await?;
        let open_key = key.clone();
        let data_dir = self.data_dir.clone();
        let connections = Arc::clone(&self.connections);
        let storage = task::spawn_blocking(move || {
            StorageHandle::open_blocking(&open_key, &data_dir, &connections)
        })
        .await
        .map_err(|err| ServiceError::StorageInit(format!("storage task panicked: {err}")))??;

        info!(key = %key, "Storage session created");
        sessions.insert(key.clone(), Session::new(key.clone(), storage.clone()));
        Ok(storage)
    }

    /// Ensures storage exists for `key`. Always `Ok(true)` on success; a
    /// failure is reported as an error, never as `Ok(false)`. The calling
    /// shell relies on this shape.
    pub async fn is_available(&self, key: &SessionKey) -> Result<bool, ServiceError> {
        self.get_or_create(key).await?;
        Ok(true)
    }

    /// Resolves the handle for `key` and dispatches a named operation.
    pub async fn call_method(
        &self,
        key: &SessionKey,
        name: &str,
        args: Value,
    ) -> Result<Value, ServiceError> {
        let call = StorageCall::parse(name, args)?;
        let storage = self.get_or_create(key).await?;
        storage.call(call).await
    }

    /// All persisted settings for the key, as one JSON object.
    pub async fn settings_snapshot(&self, key: &SessionKey) -> Result<Value, ServiceError> {
        let storage = self.get_or_create(key).await?;
        storage.call(StorageCall::ListSettings).await
    }
}
