//! Backup creation.
//!
//! Tables are frozen, every file of every part goes through the dedup
//! protocol on a bounded worker pool, and the manifest is written last. A
//! failed create leaves no manifest and drops every reference it added.

use super::context::join_workers;
use super::{advance, new_backup_id, OperationContext, Orchestrator};
use crate::catalog::manifest::entry_owner;
use crate::catalog::{BackupManifest, BackupState, FileEntry, PartEntry, TableSnapshot};
use crate::database::{FrozenPart, TableRef};
use crate::dedup::{DedupIndex, RefOwner, Reservation, Reserve, StoredObject};
use crate::fs::digest::{Codec, ContentHash};
use crate::fs::walker::{walk_part, FileInfo, WalkOptions};
use crate::storage::StorageBackend;
use crate::transfer::progress::{format_bytes, spawn_reporter, TransferStats};
use crate::utils::errors::{BackupError, Result};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rounds of the lookup/upload protocol before a file gives up.
const PROTOCOL_ATTEMPTS: u32 = 8;

/// Raw bytes covered by one worker permit; larger files hold more permits.
const PERMIT_BYTES: u64 = 64 * 1024 * 1024;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Number of pool permits a file holds while in memory.
fn permits_for(size: u64, budget: usize) -> u32 {
    let wanted = (size / PERMIT_BYTES).saturating_add(1);
    wanted.min(budget.max(1) as u64) as u32
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Reuse unchanged parts of the newest backup; `None` uses configuration
    pub incremental: Option<bool>,

    /// Ignore `backup.min_interval`
    pub force: bool,

    pub labels: BTreeMap<String, String>,

    /// Limit the backup to these tables
    pub tables: Vec<TableRef>,

    /// Store access entities even if `backup.backup_access_control` is off
    pub access_control: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateReport {
    pub backup_id: String,
    pub state: BackupState,

    /// An existing recent backup was reported instead of creating one
    pub skipped: bool,

    pub basis: Option<String>,
    pub tables: usize,
    pub parts: usize,
    pub reused_parts: usize,
    pub files: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub deduplicated_bytes: u64,
    pub duration_secs: u64,
}

impl CreateReport {
    fn from_manifest(manifest: &BackupManifest, reused_parts: usize, skipped: bool, start: Instant) -> Self {
        Self {
            backup_id: manifest.backup_id.clone(),
            state: manifest.state,
            skipped,
            basis: manifest.basis.clone(),
            tables: manifest.tables.len(),
            parts: manifest.part_count(),
            reused_parts,
            files: manifest.file_count(),
            total_bytes: manifest.total_bytes,
            uploaded_bytes: manifest.uploaded_bytes,
            deduplicated_bytes: manifest.deduplicated_bytes,
            duration_secs: start.elapsed().as_secs(),
        }
    }
}

/// One file waiting for the dedup protocol.
struct FileJob {
    table: usize,
    part: usize,
    index: usize,
    info: FileInfo,
    owner: RefOwner,
}

/// Everything a file task needs, cheap to clone into the task.
#[derive(Clone)]
struct FileStore {
    dedup: Arc<dyn DedupIndex>,
    storage: Arc<dyn StorageBackend>,
    codec: Codec,
    lease: Duration,
    poll: Duration,
    stats: Arc<TransferStats>,
}

impl FileStore {
    /// Store one file: reference existing content or upload it.
    async fn store(&self, ctx: &OperationContext, info: &FileInfo, owner: &RefOwner) -> Result<FileEntry> {
        let data = tokio::fs::read(&info.path).await?;
        let size = data.len() as u64;
        let (hash, data) = tokio::task::spawn_blocking(move || (ContentHash::of(&data), data)).await?;
        let data = Arc::new(data);

        for attempt in 1..=PROTOCOL_ATTEMPTS {
            ctx.checkpoint()?;
            let outcome = self
                .dedup
                .lookup_or_reserve(&hash, self.lease, self.poll, ctx.cancel_token())
                .await?;
            match outcome {
                Reserve::Hit { object } => match self.dedup.add_reference(&hash, owner).await {
                    Ok(_) => {
                        self.stats.record_dedup(size);
                        return Ok(entry(info, hash, size, &object));
                    }
                    Err(BackupError::DedupRecordUnavailable(_)) => {
                        debug!(hash = %hash, attempt, "Record went away before referencing, retrying");
                    }
                    Err(e) => return Err(e),
                },
                Reserve::Miss { reservation } => {
                    match self.upload(ctx, &reservation, &data, owner).await {
                        Ok(object) => {
                            self.stats.record_transfer(size, object.stored_size);
                            return Ok(entry(info, hash, size, &object));
                        }
                        Err(BackupError::DedupReservationExpired(_)) => {
                            warn!(hash = %hash, attempt, "Reservation taken over during upload, retrying");
                        }
                        Err(e) => {
                            if let Err(release_err) = self.dedup.release(&reservation).await {
                                warn!(hash = %hash, "Failed to release reservation: {}", release_err);
                            }
                            return Err(e);
                        }
                    }
                }
                Reserve::InFlight { .. } => {}
            }
        }
        Err(BackupError::coordination(format!(
            "gave up storing {} ({hash}) after {PROTOCOL_ATTEMPTS} attempts",
            owner.entry
        )))
    }

    async fn upload(
        &self,
        ctx: &OperationContext,
        reservation: &Reservation,
        data: &Arc<Vec<u8>>,
        owner: &RefOwner,
    ) -> Result<StoredObject> {
        let codec = self.codec;
        let raw = Arc::clone(data);
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&raw)).await??;
        let object = StoredObject {
            key: reservation.hash.storage_key(),
            compressed: codec.is_compressed(),
            stored_size: encoded.len() as u64,
        };

        ctx.checkpoint()?;
        ctx.run(self.storage.put(&object.key, Bytes::from(encoded)))
            .await?;
        ctx.checkpoint()?;
        self.dedup.commit(reservation, &object, owner).await?;
        Ok(object)
    }
}

fn entry(info: &FileInfo, hash: ContentHash, size: u64, object: &StoredObject) -> FileEntry {
    FileEntry {
        path: info.relative_path.clone(),
        hash,
        size,
        compressed: object.compressed,
        stored_size: object.stored_size,
    }
}

impl Orchestrator {
    /// Take a new backup of the configured scope.
    pub async fn create(&self, options: CreateOptions, cancel: &CancellationToken) -> Result<CreateReport> {
        let backup_id = new_backup_id();
        let scope = self.config.backup.scope.clone();
        let ctx = self.lock_scope(&backup_id, &scope, cancel).await?;
        let result = self.create_locked(&ctx, &options).await;
        self.release_scope(&ctx).await;
        result
    }

    async fn create_locked(&self, ctx: &OperationContext, options: &CreateOptions) -> Result<CreateReport> {
        let start = Instant::now();
        let backup = &self.config.backup;
        let existing = self.catalog.list_scope(&ctx.scope).await?;
        let newest_finished = existing
            .iter()
            .rev()
            .find(|m| m.state == BackupState::Finished);

        if !options.force && !backup.min_interval.is_zero() {
            if let Some(recent) = newest_finished {
                let age = (Utc::now() - recent.created_at).to_std().unwrap_or(Duration::ZERO);
                if age < backup.min_interval {
                    info!(
                        backup_id = %recent.backup_id,
                        "Newest backup is younger than min_interval, skipping create"
                    );
                    return Ok(CreateReport::from_manifest(recent, 0, true, start));
                }
            }
        }

        let incremental = options.incremental.unwrap_or(backup.incremental);
        let basis = if incremental {
            newest_finished.filter(|m| {
                let age = (Utc::now() - m.created_at).to_std().unwrap_or(Duration::ZERO);
                age < backup.deduplication_age_limit
            })
        } else {
            None
        };

        info!(
            backup_id = %ctx.backup_id,
            scope = %ctx.scope,
            basis = basis.map(|b| b.backup_id.as_str()).unwrap_or("-"),
            "Starting backup"
        );

        let tag = format!("ch-backup-{}", ctx.backup_id);
        let mut state = BackupState::Created;
        advance(ctx, &mut state, BackupState::InProgress)?;

        match self.build_backup(ctx, options, basis, &tag, &mut state).await {
            Ok((manifest, reused_parts)) => {
                if let Err(e) = self.database.unfreeze(&tag).await {
                    warn!(backup_id = %ctx.backup_id, "Failed to remove frozen data: {}", e);
                }
                info!(
                    backup_id = %ctx.backup_id,
                    files = manifest.file_count(),
                    total = %format_bytes(manifest.total_bytes),
                    uploaded = %format_bytes(manifest.uploaded_bytes),
                    deduplicated = %format_bytes(manifest.deduplicated_bytes),
                    "Backup finished"
                );
                Ok(CreateReport::from_manifest(&manifest, reused_parts, false, start))
            }
            Err(e) => {
                if let Err(transition) = advance(ctx, &mut state, BackupState::Failed) {
                    warn!(backup_id = %ctx.backup_id, "Could not mark backup failed: {}", transition);
                }
                error!(backup_id = %ctx.backup_id, "Backup failed: {}", e);
                self.rollback(ctx).await;
                if !backup.keep_frozen_data_on_failure {
                    if let Err(e) = self.database.unfreeze(&tag).await {
                        warn!(backup_id = %ctx.backup_id, "Failed to remove frozen data: {}", e);
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop every reference the failed backup added. Whatever cannot be
    /// dropped now is found later by the orphan sweep.
    async fn rollback(&self, ctx: &OperationContext) {
        match self
            .coordination
            .dedup
            .remove_backup_references(&ctx.backup_id)
            .await
        {
            Ok(zeroed) => info!(
                backup_id = %ctx.backup_id,
                unreferenced = zeroed.len(),
                "Rolled back dedup references"
            ),
            Err(e) => warn!(
                backup_id = %ctx.backup_id,
                "Rollback of dedup references failed, left for sweep: {}", e
            ),
        }
    }

    async fn select_tables(&self, filter: &[TableRef]) -> Result<Vec<TableRef>> {
        let all = self
            .database
            .list_tables(&self.config.clickhouse.exclude_dbs)
            .await?;
        if filter.is_empty() {
            return Ok(all);
        }
        if let Some(missing) = filter.iter().find(|t| !all.contains(t)) {
            return Err(BackupError::PolicyViolation(format!(
                "table {missing} does not exist or is excluded"
            )));
        }
        Ok(all.into_iter().filter(|t| filter.contains(t)).collect())
    }

    async fn build_backup(
        &self,
        ctx: &OperationContext,
        options: &CreateOptions,
        basis: Option<&BackupManifest>,
        tag: &str,
        state: &mut BackupState,
    ) -> Result<(BackupManifest, usize)> {
        let tables = self.select_tables(&options.tables).await?;

        let mut manifest = BackupManifest::new(&ctx.backup_id, &ctx.scope, &self.hostname);
        manifest.labels = self.config.backup.labels.clone();
        manifest.labels.extend(options.labels.clone());
        manifest.basis = basis.map(|b| b.backup_id.clone());

        for table in &tables {
            if !manifest.databases.contains_key(&table.database) {
                let schema = self.database.database_schema(&table.database).await?;
                manifest.databases.insert(table.database.clone(), schema);
            }
        }
        if options.access_control || self.config.backup.backup_access_control {
            ctx.checkpoint()?;
            manifest.access_control = self.database.access_entities().await?;
            info!(
                backup_id = %ctx.backup_id,
                entities = manifest.access_control.len(),
                "Captured access entities"
            );
        }

        let stats = TransferStats::new();
        let mut jobs = Vec::new();
        let mut reused_parts = 0usize;

        for table in &tables {
            ctx.checkpoint()?;
            let schema = self.database.table_schema(table).await?;
            let frozen = self.database.freeze(table, tag).await?;
            let mut snapshot = TableSnapshot::new(&table.database, &table.name, schema);
            let basis_table = basis.and_then(|b| b.table(&table.database, &table.name));
            let table_index = manifest.tables.len();

            for part in frozen.parts {
                let files = read_part(&part).await?;
                let size = files.iter().map(|f| f.size).sum();
                let mut entry = PartEntry {
                    name: part.name.clone(),
                    checksum: part.checksum.clone(),
                    size,
                    files: Vec::new(),
                };

                let reusable = basis_table.and_then(|t| t.part(&part.name)).filter(|old| {
                    let listing: Vec<(String, u64)> =
                        files.iter().map(|f| (f.relative_path.clone(), f.size)).collect();
                    !part.checksum.is_empty() && old.same_content(&part.name, &part.checksum, &listing)
                });
                if let Some(old) = reusable {
                    if self.reuse_part(ctx, &snapshot, old, &stats).await? {
                        entry.files = old.files.clone();
                        snapshot.parts.push(entry);
                        reused_parts += 1;
                        continue;
                    }
                }

                let part_index = snapshot.parts.len();
                for (index, info) in files.into_iter().enumerate() {
                    let owner = entry_owner(&ctx.backup_id, &snapshot, &entry, &info.relative_path);
                    jobs.push(FileJob {
                        table: table_index,
                        part: part_index,
                        index,
                        info,
                        owner,
                    });
                }
                snapshot.parts.push(entry);
            }
            manifest.tables.push(snapshot);
        }

        advance(ctx, state, BackupState::Uploading)?;
        let stored = self.store_files(ctx, jobs, Arc::clone(&stats)).await?;
        // Keyed by (table, part, file), so each part's files land in walk order.
        for ((table, part, _), file) in stored {
            manifest.tables[table].parts[part].files.push(file);
        }

        let totals = stats.snapshot();
        manifest.total_bytes = manifest.files().map(|(_, _, f)| f.size).sum();
        manifest.uploaded_bytes = totals.transferred_bytes;
        manifest.deduplicated_bytes = totals.deduplicated_bytes;

        advance(ctx, state, BackupState::Finalizing)?;
        manifest.state = BackupState::Finished;
        manifest.finished_at = Some(Utc::now());
        ctx.checkpoint()?;
        self.catalog.write(&manifest).await?;
        advance(ctx, state, BackupState::Finished)?;
        Ok((manifest, reused_parts))
    }

    /// Reference every file of an unchanged basis part. Returns `false` when
    /// some content is no longer available and the part must be stored anew.
    async fn reuse_part(
        &self,
        ctx: &OperationContext,
        table: &TableSnapshot,
        old: &PartEntry,
        stats: &TransferStats,
    ) -> Result<bool> {
        ctx.checkpoint()?;
        for file in &old.files {
            let owner = entry_owner(&ctx.backup_id, table, old, &file.path);
            match self.coordination.dedup.add_reference(&file.hash, &owner).await {
                Ok(_) => {}
                Err(BackupError::DedupRecordUnavailable(_)) => {
                    info!(
                        backup_id = %ctx.backup_id,
                        part = %old.name,
                        "Basis content unavailable, storing part in full"
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        for file in &old.files {
            stats.record_dedup(file.size);
        }
        debug!(backup_id = %ctx.backup_id, table = %table.full_name(), part = %old.name, "Reused part");
        Ok(true)
    }

    /// Run the dedup protocol for every job on the worker pool. The first
    /// failure stops the remaining tasks.
    async fn store_files(
        &self,
        ctx: &OperationContext,
        jobs: Vec<FileJob>,
        stats: Arc<TransferStats>,
    ) -> Result<BTreeMap<(usize, usize, usize), FileEntry>> {
        let budget = self.config.backup.upload_concurrency;
        let total_bytes: u64 = jobs.iter().map(|j| j.info.size).sum();
        let total_files = jobs.len() as u64;
        info!(
            backup_id = %ctx.backup_id,
            files = total_files,
            bytes = %format_bytes(total_bytes),
            concurrency = budget,
            "Storing files"
        );

        let store = FileStore {
            dedup: Arc::clone(&self.coordination.dedup),
            storage: Arc::clone(&self.storage),
            codec: Codec::from_config(
                &self.config.backup.compression,
                self.config.backup.compression_level,
            )?,
            lease: self.config.coordination.reservation_lease,
            poll: self.config.coordination.reservation_poll,
            stats: Arc::clone(&stats),
        };
        let semaphore = Arc::new(Semaphore::new(budget.max(1)));
        let tasks = ctx.child();

        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(
            "create",
            ctx.backup_id.clone(),
            stats,
            total_bytes,
            total_files,
            PROGRESS_INTERVAL,
            reporter_stop.clone(),
        );

        // Smallest first, so large files do not hold the pool while many
        // small ones wait.
        let mut jobs = jobs;
        jobs.sort_by_key(|j| j.info.size);

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let store = store.clone();
            let sem = Arc::clone(&semaphore);
            let task_ctx = tasks.clone();
            let weight = permits_for(job.info.size, budget);
            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = sem.acquire_many_owned(weight) => permit.map_err(|e| {
                        BackupError::Cancelled(format!("worker pool closed: {e}"))
                    })?,
                    _ = task_ctx.cancel_token().cancelled() => {
                        return Err(BackupError::Cancelled(task_ctx.backup_id.clone()));
                    }
                };
                let entry = store.store(&task_ctx, &job.info, &job.owner).await?;
                Ok(((job.table, job.part, job.index), entry))
            }));
        }

        let joined = join_workers(&tasks, handles).await;
        reporter_stop.cancel();
        let _ = reporter.await;

        match joined {
            Ok(done) => Ok(done.into_iter().collect()),
            Err(e) => {
                // A lost lock or outer cancellation explains the failure better.
                ctx.checkpoint()?;
                Err(e)
            }
        }
    }
}

/// Walk a frozen part off the runtime.
async fn read_part(part: &FrozenPart) -> Result<Vec<FileInfo>> {
    let path = part.path.clone();
    Ok(tokio::task::spawn_blocking(move || walk_part(&path, &WalkOptions::default())).await??)
}
