//! Test doubles: an on-disk fake database and a multi-node harness sharing
//! one object store and one coordination backend.

use crate::config::Config;
use crate::coordination::{Coordination, SqliteCoordinator};
use crate::database::{
    DatabaseClient, FrozenPart, FrozenTable, PartInfo, RestoredPart, TableRef,
};
use crate::fs::digest::ContentHash;
use crate::fs::walker::{walk_part, WalkOptions};
use crate::orchestrator::Orchestrator;
use crate::retry::RetryPolicy;
use crate::storage::{MemoryBackend, CONTENT_PREFIX};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub type PartFiles = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct FakeTable {
    schema: String,
    parts: BTreeMap<String, PartFiles>,
}

#[derive(Default)]
struct FakeState {
    /// Database name to `CREATE DATABASE` statement
    databases: BTreeMap<String, String>,
    tables: BTreeMap<TableRef, FakeTable>,
    access: Vec<String>,
    /// Parts attached by restore, per table
    attached: BTreeMap<TableRef, BTreeMap<String, PartFiles>>,
}

/// Database whose tables live in memory and whose frozen snapshots are real
/// directories under `root/shadow`.
pub struct FakeDatabase {
    root: PathBuf,
    state: Mutex<FakeState>,
}

fn table_ref(full: &str) -> TableRef {
    TableRef::parse(full).unwrap()
}

fn part_checksum(files: &PartFiles) -> String {
    let mut buf = Vec::new();
    for (name, data) in files {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&ContentHash::of(data).as_str().as_bytes()[..16]);
    }
    ContentHash::of(&buf).as_str()[..32].to_string()
}

impl FakeDatabase {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_part(&self, table: &str, part: &str, files: &[(&str, &[u8])]) {
        let table = table_ref(table);
        let mut state = self.state();
        state
            .databases
            .entry(table.database.clone())
            .or_insert_with(|| format!("CREATE DATABASE {} ENGINE = Atomic", table.database));
        let entry = state.tables.entry(table.clone()).or_insert_with(|| FakeTable {
            schema: format!("CREATE TABLE {table} (x UInt64) ENGINE = MergeTree ORDER BY x"),
            parts: BTreeMap::new(),
        });
        entry.parts.insert(
            part.to_string(),
            files
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
        );
    }

    pub fn remove_part(&self, table: &str, part: &str) {
        if let Some(t) = self.state().tables.get_mut(&table_ref(table)) {
            t.parts.remove(part);
        }
    }

    pub fn drop_table(&self, table: &str) {
        self.state().tables.remove(&table_ref(table));
    }

    /// Drop a database with all of its tables.
    pub fn drop_database(&self, database: &str) {
        let mut state = self.state();
        state.databases.remove(database);
        state.tables.retain(|t, _| t.database != database);
    }

    pub fn set_database_schema(&self, database: &str, schema: &str) {
        self.state()
            .databases
            .insert(database.to_string(), schema.to_string());
    }

    pub fn database_schema_of(&self, database: &str) -> Option<String> {
        self.state().databases.get(database).cloned()
    }

    pub fn add_access_entity(&self, statement: &str) {
        self.state().access.push(statement.to_string());
    }

    pub fn access(&self) -> Vec<String> {
        self.state().access.clone()
    }

    pub fn clear_access(&self) {
        self.state().access.clear();
    }

    pub fn part_files(&self, table: &str, part: &str) -> PartFiles {
        self.state().tables[&table_ref(table)].parts[part].clone()
    }

    /// Content of a part attached by restore.
    pub fn attached_part(&self, table: &str, part: &str) -> Option<PartFiles> {
        self.state()
            .attached
            .get(&table_ref(table))
            .and_then(|parts| parts.get(part))
            .cloned()
    }

    pub fn attached_count(&self) -> usize {
        self.state().attached.values().map(BTreeMap::len).sum()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state().tables.contains_key(&table_ref(table))
    }

    /// Snapshot names still on disk.
    pub fn frozen_tags(&self) -> Vec<String> {
        match std::fs::read_dir(self.root.join("shadow")) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl DatabaseClient for FakeDatabase {
    async fn list_tables(&self, exclude_dbs: &[String]) -> Result<Vec<TableRef>> {
        Ok(self
            .state()
            .tables
            .keys()
            .filter(|t| !exclude_dbs.contains(&t.database))
            .cloned()
            .collect())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<String> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| BackupError::Database(format!("no table {table}")))
    }

    async fn database_schema(&self, database: &str) -> Result<String> {
        self.state()
            .databases
            .get(database)
            .cloned()
            .ok_or_else(|| BackupError::Database(format!("no database {database}")))
    }

    async fn access_entities(&self) -> Result<Vec<String>> {
        Ok(self.state().access.clone())
    }

    async fn list_parts(&self, table: &TableRef) -> Result<Vec<PartInfo>> {
        let state = self.state();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| BackupError::Database(format!("no table {table}")))?;
        Ok(t.parts
            .iter()
            .map(|(name, files)| PartInfo {
                name: name.clone(),
                checksum: part_checksum(files),
                bytes_on_disk: files.values().map(|d| d.len() as u64).sum(),
            })
            .collect())
    }

    async fn freeze(&self, table: &TableRef, tag: &str) -> Result<FrozenTable> {
        let parts: Vec<(String, PartFiles)> = {
            let state = self.state();
            let t = state
                .tables
                .get(table)
                .ok_or_else(|| BackupError::Database(format!("no table {table}")))?;
            t.parts.iter().map(|(n, f)| (n.clone(), f.clone())).collect()
        };

        let base = self
            .root
            .join("shadow")
            .join(tag)
            .join(&table.database)
            .join(&table.name);
        let mut frozen = Vec::new();
        for (name, files) in parts {
            let dir = base.join(&name);
            for (file, data) in &files {
                let path = dir.join(file);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, data)?;
            }
            frozen.push(FrozenPart {
                checksum: part_checksum(&files),
                name,
                path: dir,
            });
        }
        Ok(FrozenTable {
            table: table.clone(),
            tag: tag.to_string(),
            parts: frozen,
        })
    }

    async fn unfreeze(&self, tag: &str) -> Result<()> {
        let dir = self.root.join("shadow").join(tag);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    async fn ensure_database(&self, database: &str, schema: &str) -> Result<()> {
        self.state()
            .databases
            .entry(database.to_string())
            .or_insert_with(|| schema.to_string());
        Ok(())
    }

    async fn ensure_table(&self, table: &TableRef, schema: &str) -> Result<()> {
        let mut state = self.state();
        state
            .databases
            .entry(table.database.clone())
            .or_insert_with(|| format!("CREATE DATABASE {}", table.database));
        state
            .tables
            .entry(table.clone())
            .or_insert_with(|| FakeTable {
                schema: schema.to_string(),
                parts: BTreeMap::new(),
            });
        Ok(())
    }

    async fn attach(&self, table: &TableRef, parts: &[RestoredPart]) -> Result<()> {
        let mut staged = Vec::new();
        for part in parts {
            let files = walk_part(&part.path, &WalkOptions::default())?;
            let mut content = PartFiles::new();
            for file in files {
                content.insert(file.relative_path, std::fs::read(&file.path)?);
            }
            staged.push((part.name.clone(), content));
        }
        let mut state = self.state();
        for (name, content) in staged {
            if let Some(t) = state.tables.get_mut(table) {
                t.parts.insert(name.clone(), content.clone());
            }
            state
                .attached
                .entry(table.clone())
                .or_default()
                .insert(name, content);
        }
        Ok(())
    }

    async fn restore_access_entity(&self, statement: &str) -> Result<()> {
        let mut state = self.state();
        if !state.access.iter().any(|s| s == statement) {
            state.access.push(statement.to_string());
        }
        Ok(())
    }
}

/// Shared infrastructure for several simulated nodes.
pub struct Harness {
    pub dir: TempDir,
    pub storage: Arc<MemoryBackend>,
    pub coordination: Coordination,
    pub database: Arc<FakeDatabase>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_coordination(|_| Coordination::in_memory())
    }

    /// Coordination through one SQLite file, as separate processes would.
    pub fn sqlite() -> Self {
        Self::with_coordination(|dir| {
            let coordinator = Arc::new(
                SqliteCoordinator::open(&dir.join("coordination.db"), RetryPolicy::none()).unwrap(),
            );
            Coordination {
                dedup: coordinator.clone(),
                locks: coordinator,
            }
        })
    }

    fn with_coordination(make: impl FnOnce(&Path) -> Coordination) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database = Arc::new(FakeDatabase::new(&dir.path().join("clickhouse")));

        let mut config = Config::default();
        config.backup.scope = "test".into();
        config.backup.restore_dir = dir.path().join("restore");
        config.backup.keep_frozen_data_on_failure = false;
        config.coordination.lock_lease = Duration::from_secs(5);
        config.coordination.lock_wait = Duration::ZERO;
        config.coordination.reservation_lease = Duration::from_secs(5);
        config.coordination.reservation_poll = Duration::from_millis(20);
        config.retry.max_attempts = 1;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 1;

        Self {
            coordination: make(dir.path()),
            storage: Arc::new(MemoryBackend::new()),
            database,
            config,
            dir,
        }
    }

    /// A node of the configured scope.
    pub fn node(&self, holder: &str) -> Orchestrator {
        self.node_with(holder, self.config.clone())
    }

    pub fn node_with(&self, holder: &str, config: Config) -> Orchestrator {
        Orchestrator::new(
            config,
            self.storage.clone(),
            self.coordination.clone(),
            self.database.clone(),
        )
        .with_holder(holder)
    }

    /// Content objects currently in storage.
    pub fn content_keys(&self) -> Vec<String> {
        self.storage
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(CONTENT_PREFIX))
            .collect()
    }

    pub async fn refcount(&self, data: &[u8]) -> Option<u64> {
        self.coordination
            .dedup
            .record(&ContentHash::of(data))
            .await
            .unwrap()
            .map(|r| r.refcount)
    }
}
