//! Backup deletion.
//!
//! The manifest is first marked `Deleting`, then every reference is
//! released, then the manifest is removed. An interrupted delete is resumed
//! by deleting the same backup again.

use super::{OperationContext, Orchestrator};
use crate::catalog::BackupState;
use crate::fs::digest::ContentHash;
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub backup_id: String,
    pub released_references: usize,

    /// Hashes left without references
    pub unreferenced: usize,

    pub objects_deleted: usize,
    pub bytes_freed: u64,
}

impl Orchestrator {
    /// Delete a backup under its scope lock. `force` allows deleting the
    /// incremental basis of other finished backups.
    pub async fn delete(
        &self,
        backup_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<DeleteReport> {
        let scope = self.catalog.read(backup_id).await?.scope;
        let ctx = self.lock_scope(backup_id, &scope, cancel).await?;
        let collect = self.config.retention.collect_on_delete;
        let result = self.delete_locked(&ctx, force, collect).await;
        self.release_scope(&ctx).await;
        result
    }

    /// Delete `ctx.backup_id`; the caller holds the scope lock.
    pub(crate) async fn delete_locked(
        &self,
        ctx: &OperationContext,
        force: bool,
        collect: bool,
    ) -> Result<DeleteReport> {
        let backup_id = ctx.backup_id.as_str();
        let manifest = self.catalog.read(backup_id).await?;
        match manifest.state {
            BackupState::Finished | BackupState::Failed => {}
            BackupState::Deleting => info!(backup_id, "Resuming interrupted delete"),
            other => {
                return Err(BackupError::PolicyViolation(format!(
                    "backup {backup_id} is {other} and cannot be deleted"
                )))
            }
        }

        if manifest.state != BackupState::Deleting && !force {
            let dependants: Vec<String> = self
                .catalog
                .manifests()
                .await?
                .into_iter()
                .filter(|m| {
                    m.state == BackupState::Finished && m.basis.as_deref() == Some(backup_id)
                })
                .map(|m| m.backup_id)
                .collect();
            if !dependants.is_empty() {
                return Err(BackupError::PolicyViolation(format!(
                    "backup {backup_id} is the incremental basis of {}; use --force to delete it anyway",
                    dependants.join(", ")
                )));
            }
        }

        ctx.checkpoint()?;
        let manifest = self.catalog.mark_state(backup_id, BackupState::Deleting).await?;

        let dedup = &self.coordination.dedup;
        let mut zeroed: BTreeSet<ContentHash> = BTreeSet::new();
        let mut released = 0usize;
        for (owner, hash) in manifest.owners() {
            if released % 256 == 0 {
                ctx.checkpoint()?;
            }
            if dedup.remove_reference(hash, &owner).await? == 0 {
                zeroed.insert(hash.clone());
            }
            released += 1;
        }
        // References left behind by an earlier, failed attempt under this id.
        zeroed.extend(dedup.remove_backup_references(backup_id).await?);
        debug!(backup_id, released, unreferenced = zeroed.len(), "References released");

        ctx.checkpoint()?;
        self.catalog.delete(backup_id).await?;

        let mut report = DeleteReport {
            backup_id: backup_id.to_string(),
            released_references: released,
            unreferenced: zeroed.len(),
            ..Default::default()
        };
        if collect && !zeroed.is_empty() {
            let hashes: Vec<ContentHash> = zeroed.into_iter().collect();
            let collected = self.collector().collect(ctx, &hashes).await?;
            report.objects_deleted = collected.objects_deleted;
            report.bytes_freed = collected.bytes_freed;
        }
        info!(
            backup_id,
            released = report.released_references,
            objects_deleted = report.objects_deleted,
            "Backup deleted"
        );
        Ok(report)
    }
}
