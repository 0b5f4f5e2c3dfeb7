//! Manifest types describing one backup.
//!
//! A manifest records every table, part and file of a backup together with the
//! content hash each file was deduplicated under. It is serialized as
//! `backups/<backup_id>/manifest.json` and written exactly once.

use crate::dedup::RefOwner;
use crate::fs::digest::ContentHash;
use crate::storage::BACKUPS_PREFIX;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Manifest layout version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Storage key of a backup's manifest.
pub fn manifest_key(backup_id: &str) -> String {
    format!("{BACKUPS_PREFIX}{backup_id}/manifest.json")
}

/// Backup id encoded in a manifest key, if `key` is one.
pub fn backup_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(BACKUPS_PREFIX)?
        .strip_suffix("/manifest.json")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Lifecycle of a backup.
///
/// Only `Finished`, `Failed` and `Deleting` are ever persisted; the earlier
/// states exist while a create is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Created,
    InProgress,
    Uploading,
    Finalizing,
    Finished,
    Failed,
    Deleting,
    Deleted,
}

impl BackupState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: BackupState) -> bool {
        use BackupState::*;
        match (self, next) {
            (Created, InProgress) | (InProgress, Uploading) | (Uploading, Finalizing) => true,
            (Finalizing, Finished) => true,
            (Created | InProgress | Uploading | Finalizing, Failed) => true,
            (Finished | Failed, Deleting) => true,
            // An interrupted delete is resumed from the Deleting state.
            (Deleting, Deleting) | (Deleting, Deleted) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::Created => "created",
            BackupState::InProgress => "in_progress",
            BackupState::Uploading => "uploading",
            BackupState::Finalizing => "finalizing",
            BackupState::Finished => "finished",
            BackupState::Failed => "failed",
            BackupState::Deleting => "deleting",
            BackupState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backup manifest - serialized as `manifest.json` under the backup's prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub backup_id: String,
    pub scope: String,
    pub state: BackupState,

    /// Node that took the backup
    pub hostname: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Backup whose parts were reused without rehashing
    pub basis: Option<String>,

    /// Raw bytes of all files
    pub total_bytes: u64,

    /// Stored bytes this backup uploaded itself
    pub uploaded_bytes: u64,

    /// Raw bytes satisfied by content already in storage
    pub deduplicated_bytes: u64,

    /// `CREATE DATABASE` statement of every database with a table in the backup
    #[serde(default)]
    pub databases: BTreeMap<String, String>,

    pub tables: Vec<TableSnapshot>,

    /// Users, roles, quotas, row policies, settings profiles and grants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_control: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub database: String,
    pub name: String,

    /// `CREATE` statement as reported by the database
    pub schema: String,

    /// SHA-256 of `schema`
    pub schema_hash: String,

    pub parts: Vec<PartEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    pub name: String,

    /// Checksum of the part as reported by the database
    pub checksum: String,

    pub size: u64,
    pub files: Vec<FileEntry>,
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// `/`-separated path inside the part directory
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub compressed: bool,
    pub stored_size: u64,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub backup_id: String,
    pub scope: String,
    pub state: BackupState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub basis: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub tables: usize,
    pub parts: usize,
    pub files: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub deduplicated_bytes: u64,
}

/// Fingerprint of a table schema.
pub fn schema_hash(schema: &str) -> String {
    hex::encode(Sha256::digest(schema.as_bytes()))
}

impl TableSnapshot {
    pub fn new(database: &str, name: &str, schema: String) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
            schema_hash: schema_hash(&schema),
            schema,
            parts: Vec::new(),
        }
    }

    /// `database.table`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn part(&self, name: &str) -> Option<&PartEntry> {
        self.parts.iter().find(|p| p.name == name)
    }
}

impl PartEntry {
    /// Whether `self` describes the same on-disk content as `other`: same
    /// name, checksum and file list.
    pub fn same_content(&self, name: &str, checksum: &str, files: &[(String, u64)]) -> bool {
        self.name == name
            && self.checksum == checksum
            && self.files.len() == files.len()
            && self
                .files
                .iter()
                .zip(files)
                .all(|(f, (path, size))| &f.path == path && f.size == *size)
    }
}

/// Reference owner tag for a file entry: `db.table/part/path`.
pub fn entry_owner(backup_id: &str, table: &TableSnapshot, part: &PartEntry, file: &str) -> RefOwner {
    RefOwner::new(
        backup_id,
        format!("{}/{}/{}", table.full_name(), part.name, file),
    )
}

impl BackupManifest {
    pub fn new(backup_id: &str, scope: &str, hostname: &str) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backup_id: backup_id.to_string(),
            scope: scope.to_string(),
            state: BackupState::Created,
            hostname: hostname.to_string(),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            finished_at: None,
            basis: None,
            total_bytes: 0,
            uploaded_bytes: 0,
            deduplicated_bytes: 0,
            databases: BTreeMap::new(),
            tables: Vec::new(),
            access_control: Vec::new(),
        }
    }

    /// Parse and check the format version. Unknown fields are ignored.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_slice(data)?;
        if manifest.format_version > FORMAT_VERSION {
            return Err(BackupError::Storage(format!(
                "manifest of {} has format version {}, this build reads up to {}",
                manifest.backup_id, manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn table(&self, database: &str, name: &str) -> Option<&TableSnapshot> {
        self.tables
            .iter()
            .find(|t| t.database == database && t.name == name)
    }

    /// Every file with its table and part, in manifest order.
    pub fn files(&self) -> impl Iterator<Item = (&TableSnapshot, &PartEntry, &FileEntry)> {
        self.tables.iter().flat_map(|t| {
            t.parts
                .iter()
                .flat_map(move |p| p.files.iter().map(move |f| (t, p, f)))
        })
    }

    /// Reference owners of every file entry.
    pub fn owners(&self) -> impl Iterator<Item = (RefOwner, &ContentHash)> {
        self.files()
            .map(|(t, p, f)| (entry_owner(&self.backup_id, t, p, &f.path), &f.hash))
    }

    pub fn part_count(&self) -> usize {
        self.tables.iter().map(|t| t.parts.len()).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    /// Whether this backup can be restored from.
    pub fn is_restorable(&self) -> bool {
        self.state == BackupState::Finished
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            backup_id: self.backup_id.clone(),
            scope: self.scope.clone(),
            state: self.state,
            created_at: self.created_at,
            finished_at: self.finished_at,
            basis: self.basis.clone(),
            labels: self.labels.clone(),
            tables: self.tables.len(),
            parts: self.part_count(),
            files: self.file_count(),
            total_bytes: self.total_bytes,
            uploaded_bytes: self.uploaded_bytes,
            deduplicated_bytes: self.deduplicated_bytes,
        }
    }
}
