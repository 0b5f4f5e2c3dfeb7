//! Garbage collection of content no backup references.
//!
//! Objects are only deleted through a deletion claim in the dedup index, so a
//! concurrent create either revives a record before the claim or waits for
//! the deletion to finish and uploads again.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::fs::digest::ContentHash;
use crate::orchestrator::OperationContext;
use crate::storage::{list_keys, StorageBackend, CONTENT_PREFIX};
use crate::transfer::progress::format_bytes;
use crate::utils::errors::Result;
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Zero-reference records claimed per round.
const SWEEP_BATCH: usize = 500;

const MAX_CLAIM_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub objects_deleted: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired_reservations: usize,

    /// Backups whose references were dropped because no manifest exists
    pub orphaned_backups: Vec<String>,

    pub objects_deleted: usize,
    pub bytes_freed: u64,

    /// Objects under the content prefix that had no dedup record
    pub stray_objects: usize,
}

pub struct GarbageCollector {
    storage: Arc<dyn StorageBackend>,
    dedup: Arc<dyn DedupIndex>,
    catalog: Catalog,
    orphan_grace: Duration,
    sweep_storage: bool,
    claim_lease: Duration,
}

impl GarbageCollector {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        dedup: Arc<dyn DedupIndex>,
        catalog: Catalog,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            dedup,
            catalog,
            orphan_grace: config.retention.orphan_grace,
            sweep_storage: config.retention.sweep_storage,
            claim_lease: config.coordination.reservation_lease,
        }
    }

    /// Physically delete the given hashes if they are still unreferenced.
    pub async fn collect(&self, ctx: &OperationContext, hashes: &[ContentHash]) -> Result<CollectReport> {
        let mut report = CollectReport::default();
        for hash in hashes {
            if let Some(freed) = self.collect_one(ctx, hash).await? {
                report.objects_deleted += 1;
                report.bytes_freed += freed;
            }
        }
        Ok(report)
    }

    /// Full pass: stale leases, orphaned references, unreferenced records and
    /// optionally stray objects in storage.
    pub async fn sweep(&self, ctx: &OperationContext) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        ctx.checkpoint()?;
        report.expired_reservations = self.dedup.expire_stale().await?;

        report.orphaned_backups = self.release_orphaned_references(ctx).await?;

        loop {
            ctx.checkpoint()?;
            let batch = self.dedup.unreferenced(SWEEP_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let collected = self.collect(ctx, &batch).await?;
            report.objects_deleted += collected.objects_deleted;
            report.bytes_freed += collected.bytes_freed;
            // Everything left in the batch is claimed elsewhere.
            if collected.objects_deleted == 0 {
                break;
            }
        }

        if self.sweep_storage {
            let stray = self.collect_stray_objects(ctx).await?;
            report.stray_objects = stray.objects_deleted;
            report.objects_deleted += stray.objects_deleted;
            report.bytes_freed += stray.bytes_freed;
        }

        info!(
            scope = %ctx.scope,
            expired = report.expired_reservations,
            orphaned = report.orphaned_backups.len(),
            objects = report.objects_deleted,
            freed = %format_bytes(report.bytes_freed),
            "Sweep finished"
        );
        Ok(report)
    }

    /// Drop references held by backups that never got a manifest, once they
    /// are older than the grace period. Younger ones may still be in progress.
    async fn release_orphaned_references(&self, ctx: &OperationContext) -> Result<Vec<String>> {
        let known = self.catalog.backup_ids().await?;
        let grace = chrono::Duration::from_std(self.orphan_grace)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = Utc::now();

        let mut released = Vec::new();
        for refs in self.dedup.referencing_backups().await? {
            if known.contains(&refs.backup_id) || now - refs.last_referenced_at < grace {
                continue;
            }
            ctx.checkpoint()?;
            let zeroed = self.dedup.remove_backup_references(&refs.backup_id).await?;
            warn!(
                backup_id = %refs.backup_id,
                refs = refs.refs,
                unreferenced = zeroed.len(),
                "Released references of backup without manifest"
            );
            released.push(refs.backup_id);
        }
        Ok(released)
    }

    async fn collect_stray_objects(&self, ctx: &OperationContext) -> Result<CollectReport> {
        let mut report = CollectReport::default();
        let mut keys = list_keys(self.storage.as_ref(), CONTENT_PREFIX);
        while let Some(key) = keys.try_next().await? {
            let Some(hash) = ContentHash::from_storage_key(&key) else {
                warn!(key, "Ignoring unexpected object under content prefix");
                continue;
            };
            if self.dedup.record(&hash).await?.is_some() {
                continue;
            }
            if let Some(freed) = self.collect_one(ctx, &hash).await? {
                debug!(hash = %hash, "Deleted object without dedup record");
                report.objects_deleted += 1;
                report.bytes_freed += freed;
            }
        }
        Ok(report)
    }

    /// Claim, delete and forget one hash. `None` when it could not be
    /// claimed (referenced again, or claimed by someone else) or when the
    /// claim ran out before the object was deleted.
    async fn collect_one(&self, ctx: &OperationContext, hash: &ContentHash) -> Result<Option<u64>> {
        ctx.checkpoint()?;
        // Measured locally so coordinator clock skew cannot stretch the claim.
        let deadline = Instant::now() + deletion_budget(self.claim_lease);
        let Some(claim) = self.dedup.claim_for_deletion(hash, self.claim_lease).await? else {
            debug!(hash = %hash, "Content not claimable, skipping");
            return Ok(None);
        };

        ctx.checkpoint()?;
        let freed = claim.object.as_ref().map_or(0, |o| o.stored_size);
        let key = claim.storage_key();

        // Once the claim lapses another node may upload the same hash again;
        // the object must not be touched after that point.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(hash = %hash, "Deletion claim too close to expiry, leaving object");
            return Ok(None);
        }
        match tokio::time::timeout(remaining, self.storage.delete(&key)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => debug!(key, "Object was already gone"),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    hash = %hash,
                    budget = ?remaining,
                    "Delete did not finish within the claim, leaving it to a later sweep"
                );
                return Ok(None);
            }
        }

        if !self.dedup.finish_deletion(&claim).await? {
            warn!(hash = %hash, "Deletion claim was taken over");
            return Ok(None);
        }
        Ok(Some(freed))
    }
}

/// Part of a claim lease usable for the storage delete. The rest absorbs
/// request latency and a delete that is still in flight when it is abandoned.
fn deletion_budget(lease: Duration) -> Duration {
    let margin = (lease / 4).min(MAX_CLAIM_MARGIN);
    lease.saturating_sub(margin)
}
