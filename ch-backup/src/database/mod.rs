//! The database side of a backup: enumerating tables and parts, freezing
//! them into a stable on-disk snapshot, and attaching restored parts.

pub mod clickhouse;

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub use clickhouse::ClickHouseClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub name: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// Parse `db.table`. The table name may itself contain dots.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => Ok(Self::new(db, table)),
            _ => Err(BackupError::Config(format!(
                "table filter must look like db.table: '{s}'"
            ))),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// Active part as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub name: String,
    pub checksum: String,
    pub bytes_on_disk: u64,
}

/// A frozen (hard-linked, immutable) part on local disk.
#[derive(Debug, Clone)]
pub struct FrozenPart {
    pub name: String,
    pub checksum: String,
    pub path: PathBuf,
}

/// Result of freezing one table.
#[derive(Debug, Clone)]
pub struct FrozenTable {
    pub table: TableRef,
    pub tag: String,
    pub parts: Vec<FrozenPart>,
}

/// A part reconstructed from a backup, staged on local disk.
#[derive(Debug, Clone)]
pub struct RestoredPart {
    pub name: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Tables worth backing up, skipping databases in `exclude_dbs`.
    async fn list_tables(&self, exclude_dbs: &[String]) -> Result<Vec<TableRef>>;

    /// `CREATE` statement of a table.
    async fn table_schema(&self, table: &TableRef) -> Result<String>;

    /// `CREATE` statement of a database, carrying its engine.
    async fn database_schema(&self, database: &str) -> Result<String>;

    /// `CREATE` statements of users, roles, quotas, row policies and
    /// settings profiles, followed by the grants between them.
    async fn access_entities(&self) -> Result<Vec<String>>;

    async fn list_parts(&self, table: &TableRef) -> Result<Vec<PartInfo>>;

    /// Freeze every active part of `table` under the snapshot name `tag`.
    async fn freeze(&self, table: &TableRef, tag: &str) -> Result<FrozenTable>;

    /// Remove the snapshot `tag` from disk.
    async fn unfreeze(&self, tag: &str) -> Result<()>;

    /// Create `database` from `schema` unless it exists. An empty schema
    /// creates it with the server's default engine.
    async fn ensure_database(&self, database: &str, schema: &str) -> Result<()>;

    /// Create the database and table from `schema` unless they exist.
    async fn ensure_table(&self, table: &TableRef, schema: &str) -> Result<()>;

    /// Move staged parts into the table's detached directory and attach them.
    async fn attach(&self, table: &TableRef, parts: &[RestoredPart]) -> Result<()>;

    /// Replay one statement captured by `access_entities`. Entities that
    /// already exist are kept as they are.
    async fn restore_access_entity(&self, statement: &str) -> Result<()>;
}

const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE",
    "CREATE MATERIALIZED VIEW",
    "CREATE VIEW",
    "CREATE DICTIONARY",
    "CREATE DATABASE",
    "CREATE USER",
    "CREATE ROLE",
    "CREATE ROW POLICY",
    "CREATE QUOTA",
    "CREATE SETTINGS PROFILE",
    "ATTACH TABLE",
    "ATTACH DATABASE",
];

/// Turn `CREATE TABLE x` into `CREATE TABLE IF NOT EXISTS x`. Other
/// statements (grants) are returned unchanged.
pub fn create_if_not_exists(schema: &str) -> String {
    let trimmed = schema.trim_start();
    for &prefix in CREATE_STATEMENTS {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let rest = rest.trim_start();
            if rest.starts_with("IF NOT EXISTS") {
                return trimmed.to_string();
            }
            let prefix = prefix.replacen("ATTACH", "CREATE", 1);
            return format!("{prefix} IF NOT EXISTS {rest}");
        }
    }
    trimmed.to_string()
}

/// Move a directory, copying when source and target are on different
/// filesystems.
pub fn move_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            copy_dir(from, to)?;
            std::fs::remove_dir_all(from)
        }
        Err(e) => Err(e),
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
