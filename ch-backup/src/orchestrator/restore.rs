//! Restore a finished backup into the database.
//!
//! Every file is resolved, downloaded and verified into a staging directory
//! before anything is attached, so a failed restore leaves the database
//! untouched. Restore never writes to the dedup index.

use super::context::join_workers;
use super::{OperationContext, Orchestrator};
use crate::catalog::{BackupManifest, FileEntry, TableSnapshot};
use crate::database::clickhouse::escape_path_component;
use crate::database::{RestoredPart, TableRef};
use crate::dedup::StoredObject;
use crate::fs::digest::{decode, ContentHash};
use crate::storage::StorageBackend;
use crate::transfer::progress::{format_bytes, spawn_reporter, TransferStats};
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restore only these tables
    pub tables: Vec<TableRef>,

    /// Leave users, roles and grants stored in the backup alone
    pub skip_access_control: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub tables: usize,
    pub parts: usize,
    pub files: usize,
    pub bytes: u64,
    pub downloaded_bytes: u64,
    pub duration_secs: u64,
}

struct Download {
    entry: String,
    file: FileEntry,
    object: StoredObject,
    target: PathBuf,
}

/// Relative path from a manifest that cannot leave the directory it is
/// joined to.
fn contained_path<'p>(what: &str, path: &'p str, max_components: usize) -> Result<&'p Path> {
    let p = Path::new(path);
    let components = p.components().count();
    let normal = p.components().all(|c| matches!(c, Component::Normal(_)));
    if !normal || components == 0 || components > max_components {
        return Err(BackupError::RestoreIncomplete(format!(
            "manifest contains unsafe {what}: {path:?}"
        )));
    }
    Ok(p)
}

fn staged_part_dir(staging: &Path, table: &TableRef, part: &str) -> PathBuf {
    staging
        .join(escape_path_component(&table.database))
        .join(escape_path_component(&table.name))
        .join(part)
}

async fn fetch(storage: &dyn StorageBackend, job: &Download, stats: &TransferStats) -> Result<()> {
    let data = storage.get(&job.object.key).await?.ok_or_else(|| {
        BackupError::RestoreIncomplete(format!(
            "object {} for {} is missing from storage",
            job.object.key, job.entry
        ))
    })?;
    let stored = data.len() as u64;

    let compressed = job.object.compressed;
    let expected = job.file.hash.clone();
    let entry = job.entry.clone();
    let raw = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let raw = decode(&data, compressed)
            .map_err(|e| BackupError::RestoreIncomplete(format!("{entry}: {e}")))?;
        if ContentHash::of(&raw) != expected {
            return Err(BackupError::RestoreIncomplete(format!(
                "{entry}: content does not match hash {expected}"
            )));
        }
        Ok(raw)
    })
    .await??;
    if raw.len() as u64 != job.file.size {
        return Err(BackupError::RestoreIncomplete(format!(
            "{}: expected {} bytes, got {}",
            job.entry,
            job.file.size,
            raw.len()
        )));
    }

    if let Some(parent) = job.target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&job.target, &raw).await?;
    stats.record_transfer(job.file.size, stored);
    Ok(())
}

async fn remove_staging(staging: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), "Failed to remove staging directory: {}", e),
    }
}

impl Orchestrator {
    pub async fn restore(
        &self,
        backup_id: &str,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let start = Instant::now();
        let manifest = self.catalog.read(backup_id).await?;
        if !manifest.is_restorable() {
            return Err(BackupError::PolicyViolation(format!(
                "backup {backup_id} is {}, only finished backups can be restored",
                manifest.state
            )));
        }
        let ctx = OperationContext::new(
            backup_id,
            &manifest.scope,
            self.config.backup.operation_timeout,
            cancel.child_token(),
        );

        let tables = select_tables(&manifest, &options.tables)?;
        info!(backup_id, tables = tables.len(), "Starting restore");

        // Resolve everything before touching disk.
        let mut locations: HashMap<ContentHash, StoredObject> = HashMap::new();
        let staging = self.config.backup.restore_dir.join(backup_id);
        let mut downloads = Vec::new();
        let mut parts = 0usize;
        for (table_ref, table) in &tables {
            for part in &table.parts {
                parts += 1;
                contained_path("part name", &part.name, 1)?;
                let part_dir = staged_part_dir(&staging, table_ref, &part.name);
                for file in &part.files {
                    let relative = contained_path("file path", &file.path, usize::MAX)?;
                    let entry = format!("{}/{}/{}", table.full_name(), part.name, file.path);
                    let object = match locations.get(&file.hash) {
                        Some(object) => object.clone(),
                        None => {
                            ctx.checkpoint()?;
                            let object = self
                                .coordination
                                .dedup
                                .resolve(&file.hash)
                                .await?
                                .ok_or_else(|| {
                                    BackupError::RestoreIncomplete(format!(
                                        "content {} of {entry} is not in the dedup index",
                                        file.hash
                                    ))
                                })?;
                            locations.insert(file.hash.clone(), object.clone());
                            object
                        }
                    };
                    downloads.push(Download {
                        target: part_dir.join(relative),
                        entry,
                        file: file.clone(),
                        object,
                    });
                }
            }
        }

        remove_staging(&staging).await;
        tokio::fs::create_dir_all(&staging).await?;

        let stats = TransferStats::new();
        let files = downloads.len();
        if let Err(e) = self.download_all(&ctx, downloads, Arc::clone(&stats)).await {
            remove_staging(&staging).await;
            return Err(e);
        }

        // Everything is on disk and verified; only now change the database.
        let result = self.attach_all(&ctx, &manifest, &tables, &staging).await;
        remove_staging(&staging).await;
        result?;

        if !options.skip_access_control {
            self.restore_access(&ctx, &manifest).await?;
        }

        let totals = stats.snapshot();
        info!(
            backup_id,
            files,
            bytes = %format_bytes(totals.bytes),
            "Restore finished"
        );
        Ok(RestoreReport {
            backup_id: backup_id.to_string(),
            tables: tables.len(),
            parts,
            files,
            bytes: totals.bytes,
            downloaded_bytes: totals.transferred_bytes,
            duration_secs: start.elapsed().as_secs(),
        })
    }

    async fn download_all(
        &self,
        ctx: &OperationContext,
        downloads: Vec<Download>,
        stats: Arc<TransferStats>,
    ) -> Result<()> {
        let total_bytes = downloads.iter().map(|d| d.file.size).sum();
        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(
            "restore",
            ctx.backup_id.clone(),
            Arc::clone(&stats),
            total_bytes,
            downloads.len() as u64,
            Duration::from_secs(10),
            reporter_stop.clone(),
        );

        let semaphore = Arc::new(Semaphore::new(self.config.backup.upload_concurrency.max(1)));
        let tasks = ctx.child();
        let mut handles = Vec::with_capacity(downloads.len());
        for job in downloads {
            let storage = Arc::clone(&self.storage);
            let sem = Arc::clone(&semaphore);
            let stats = Arc::clone(&stats);
            let task_ctx = tasks.clone();
            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = sem.acquire_owned() => permit.map_err(|e| {
                        BackupError::Cancelled(format!("worker pool closed: {e}"))
                    })?,
                    _ = task_ctx.cancel_token().cancelled() => {
                        return Err(BackupError::Cancelled(task_ctx.backup_id.clone()));
                    }
                };
                task_ctx.checkpoint()?;
                task_ctx.run(fetch(storage.as_ref(), &job, &stats)).await
            }));
        }

        let joined = join_workers(&tasks, handles).await;
        reporter_stop.cancel();
        let _ = reporter.await;

        if let Err(e) = joined {
            ctx.checkpoint()?;
            return Err(e);
        }
        Ok(())
    }

    async fn attach_all(
        &self,
        ctx: &OperationContext,
        manifest: &BackupManifest,
        tables: &[(TableRef, &TableSnapshot)],
        staging: &Path,
    ) -> Result<()> {
        let mut databases: Vec<&str> = tables.iter().map(|(t, _)| t.database.as_str()).collect();
        databases.sort_unstable();
        databases.dedup();
        for database in databases {
            ctx.checkpoint()?;
            // Older manifests carry no database schema.
            let schema = manifest.databases.get(database).map(String::as_str).unwrap_or("");
            self.database.ensure_database(database, schema).await?;
        }

        for (table_ref, table) in tables {
            ctx.checkpoint()?;
            self.database.ensure_table(table_ref, &table.schema).await?;
            let parts: Vec<RestoredPart> = table
                .parts
                .iter()
                .map(|p| RestoredPart {
                    name: p.name.clone(),
                    path: staged_part_dir(staging, table_ref, &p.name),
                })
                .collect();
            self.database.attach(table_ref, &parts).await?;
            debug!(backup_id = %ctx.backup_id, table = %table_ref, parts = parts.len(), "Table restored");
        }
        Ok(())
    }

    async fn restore_access(&self, ctx: &OperationContext, manifest: &BackupManifest) -> Result<()> {
        if manifest.access_control.is_empty() {
            debug!(backup_id = %ctx.backup_id, "No access entities to restore");
            return Ok(());
        }
        for statement in &manifest.access_control {
            ctx.checkpoint()?;
            self.database.restore_access_entity(statement).await?;
        }
        info!(
            backup_id = %ctx.backup_id,
            entities = manifest.access_control.len(),
            "Restored access entities"
        );
        Ok(())
    }
}

fn select_tables<'a>(
    manifest: &'a BackupManifest,
    filter: &[TableRef],
) -> Result<Vec<(TableRef, &'a TableSnapshot)>> {
    if let Some(missing) = filter
        .iter()
        .find(|t| manifest.table(&t.database, &t.name).is_none())
    {
        return Err(BackupError::PolicyViolation(format!(
            "table {missing} is not part of backup {}",
            manifest.backup_id
        )));
    }
    Ok(manifest
        .tables
        .iter()
        .map(|t| (TableRef::new(&t.database, &t.name), t))
        .filter(|(r, _)| filter.is_empty() || filter.contains(r))
        .collect())
}
