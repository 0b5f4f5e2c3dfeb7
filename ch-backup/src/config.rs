//! Configuration management for ch-backup.
//!
//! Loads configuration from a TOML file with `CH_BACKUP__SECTION__KEY`
//! environment variable overrides. Every field has a default so a partial file
//! is enough.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clickhouse: ClickHouseConfig,
    pub storage: StorageConfig,
    pub coordination: CoordinationConfig,
    pub backup: BackupConfig,
    pub retention: RetentionConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
    pub main: MainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP interface host
    pub host: String,

    /// ClickHouse HTTP interface port
    pub port: u16,

    /// `http` or `https`
    pub protocol: String,

    pub user: Option<String>,
    pub password: Option<String>,

    /// ClickHouse data root (contains `data/`, `shadow/`, `metadata/`)
    pub data_path: PathBuf,

    /// Per-query timeout
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Databases never backed up
    pub exclude_dbs: Vec<String>,

    /// Owner of restored part directories
    pub owner_user: String,
    pub owner_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,

    /// Root directory for the local backend
    pub path: PathBuf,

    /// S3 endpoint URL, e.g. `https://s3.eu-central-1.amazonaws.com`
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: String,

    /// Key prefix inside the bucket
    pub root: String,

    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// SQLite database file, shared by every process that can open it
    Sqlite,
    /// Remote `ch-backup-coordinator` service
    Http,
    /// Process-local state; nothing survives the process
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub mode: CoordinationMode,

    /// SQLite database path (mode = "sqlite")
    pub db_path: PathBuf,

    /// Coordinator base URL (mode = "http")
    pub url: Option<String>,

    pub token: Option<String>,

    /// Per-request timeout for the remote coordinator
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Holder identity written into leases (default: `<hostname>:<pid>`)
    pub holder_id: Option<String>,

    /// Lease duration for scope locks
    #[serde(with = "duration_str")]
    pub lock_lease: Duration,

    /// How long to wait for a busy scope lock before giving up
    #[serde(with = "duration_str")]
    pub lock_wait: Duration,

    /// Lease on an upload reservation in the dedup index
    #[serde(with = "duration_str")]
    pub reservation_lease: Duration,

    /// Poll interval while another node uploads the same content
    #[serde(with = "duration_str")]
    pub reservation_poll: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Lock and retention scope (cluster id, shard name, ...)
    pub scope: String,

    /// Reuse unchanged parts of the newest backup by default
    pub incremental: bool,

    /// Only backups younger than this may serve as incremental basis
    #[serde(with = "duration_str")]
    pub deduplication_age_limit: Duration,

    /// Skip create when the newest finished backup is younger than this
    #[serde(with = "duration_str")]
    pub min_interval: Duration,

    /// Compression algorithm (zstd, none)
    pub compression: String,

    /// Compression level (1-22 for zstd)
    pub compression_level: i32,

    /// Parallel file uploads/downloads per backup
    pub upload_concurrency: usize,

    /// Keep frozen snapshots on disk when create fails
    pub keep_frozen_data_on_failure: bool,

    /// Staging directory for restored parts
    pub restore_dir: PathBuf,

    /// Labels attached to every new backup
    pub labels: BTreeMap<String, String>,

    /// Abort an operation that runs longer than this
    #[serde(with = "duration_opt_str")]
    pub operation_timeout: Option<Duration>,

    /// Store users, roles, quotas, row policies and settings profiles
    pub backup_access_control: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Never delete below this many finished backups
    pub min_keep: usize,

    /// Backups older than this are eligible for deletion
    #[serde(with = "duration_opt_str")]
    pub max_age: Option<Duration>,

    /// References of manifest-less backups younger than this are left alone
    #[serde(with = "duration_str")]
    pub orphan_grace: Duration,

    /// Scan the content prefix for objects with no dedup record
    pub sweep_storage: bool,

    /// Physically delete zero-refcount content right after `delete`
    pub collect_on_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// User to run as
    pub user: String,

    /// Group to run as
    pub group: String,

    /// Switch to `user`/`group` on start when running as root
    pub drop_privileges: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            protocol: "http".to_string(),
            user: None,
            password: None,
            data_path: PathBuf::from("/var/lib/clickhouse"),
            timeout: Duration::from_secs(90),
            exclude_dbs: vec![
                "system".to_string(),
                "information_schema".to_string(),
                "INFORMATION_SCHEMA".to_string(),
            ],
            owner_user: "clickhouse".to_string(),
            owner_group: "clickhouse".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            path: PathBuf::from("/var/lib/ch-backup/storage"),
            endpoint: None,
            bucket: None,
            region: "us-east-1".to_string(),
            root: String::new(),
            access_key_id: None,
            secret_access_key: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            mode: CoordinationMode::Sqlite,
            db_path: PathBuf::from("/var/lib/ch-backup/coordination.db"),
            url: None,
            token: None,
            request_timeout: Duration::from_secs(30),
            holder_id: None,
            lock_lease: Duration::from_secs(60),
            lock_wait: Duration::ZERO,
            reservation_lease: Duration::from_secs(600),
            reservation_poll: Duration::from_millis(500),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scope: "default".to_string(),
            incremental: false,
            deduplication_age_limit: Duration::from_secs(7 * 24 * 3600),
            min_interval: Duration::ZERO,
            compression: "zstd".to_string(),
            compression_level: 3,
            upload_concurrency: 4,
            keep_frozen_data_on_failure: true,
            restore_dir: PathBuf::from("/var/lib/ch-backup/restore"),
            labels: BTreeMap::new(),
            operation_timeout: None,
            backup_access_control: false,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_keep: 0,
            max_age: None,
            orphan_grace: Duration::from_secs(24 * 3600),
            sweep_storage: true,
            collect_on_delete: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            user: "clickhouse".to_string(),
            group: "clickhouse".to_string(),
            drop_privileges: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Load defaults (optionally overlaid with a file) plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CH_BACKUP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| BackupError::Config(e.to_string()))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.upload_concurrency == 0 {
            return Err(BackupError::Config(
                "backup.upload_concurrency must be at least 1".into(),
            ));
        }
        if !matches!(self.backup.compression.as_str(), "zstd" | "none") {
            return Err(BackupError::Config(format!(
                "unsupported compression: {}",
                self.backup.compression
            )));
        }
        if self.backup.scope.is_empty() || self.backup.scope.contains('/') {
            return Err(BackupError::Config(format!(
                "invalid backup.scope: '{}'",
                self.backup.scope
            )));
        }
        if self.storage.kind == StorageKind::S3
            && (self.storage.endpoint.is_none() || self.storage.bucket.is_none())
        {
            return Err(BackupError::Config(
                "storage.endpoint and storage.bucket are required for type = \"s3\"".into(),
            ));
        }
        if self.coordination.mode == CoordinationMode::Http && self.coordination.url.is_none() {
            return Err(BackupError::Config(
                "coordination.url is required for mode = \"http\"".into(),
            ));
        }
        if self.coordination.lock_lease < Duration::from_millis(100) {
            return Err(BackupError::Config(
                "coordination.lock_lease must be at least 100ms".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BackupError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Holder identity used for leases.
    pub fn holder_id(&self) -> String {
        self.coordination.holder_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "ch-backup".to_string());
            format!("{}:{}", host, std::process::id())
        })
    }
}

/// Durations written as humantime strings ("30s", "7d", "1h 30m").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

mod duration_opt_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => humantime::parse_duration(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
