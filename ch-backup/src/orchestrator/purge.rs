//! Retention enforcement and garbage collection for one scope.

use super::{OperationContext, Orchestrator};
use crate::retention::{RetentionDecision, RetentionPolicy, SweepReport};
use crate::utils::errors::Result;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PurgeDecision {
    pub backup_id: String,
    #[serde(flatten)]
    pub decision: RetentionDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub dry_run: bool,
    pub decisions: Vec<PurgeDecision>,
    pub deleted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepReport>,
}

impl Orchestrator {
    /// Apply the retention policy to the configured scope, then sweep. The
    /// scope lock is held for the whole run.
    pub async fn purge(&self, dry_run: bool, cancel: &CancellationToken) -> Result<PurgeReport> {
        let scope = self.config.backup.scope.clone();
        let ctx = self.lock_scope("purge", &scope, cancel).await?;
        let result = self.purge_locked(&ctx, &scope, dry_run).await;
        if let Err(e) = &result {
            warn!(%scope, "Purge failed: {}", e);
        }
        self.release_scope(&ctx).await;
        result
    }

    async fn purge_locked(
        &self,
        ctx: &OperationContext,
        scope: &str,
        dry_run: bool,
    ) -> Result<PurgeReport> {
        let manifests = self.catalog.list_scope(scope).await?;
        let policy = RetentionPolicy::from_config(&self.config.retention);
        let decisions = policy.evaluate(&manifests, Utc::now());

        let mut report = PurgeReport {
            dry_run,
            decisions: decisions
                .iter()
                .map(|(id, d)| PurgeDecision {
                    backup_id: id.clone(),
                    decision: d.clone(),
                })
                .collect(),
            deleted: Vec::new(),
            sweep: None,
        };
        if dry_run {
            info!(
                scope,
                eligible = decisions.iter().filter(|(_, d)| d.is_delete()).count(),
                "Dry run, nothing deleted"
            );
            return Ok(report);
        }

        // Bases are protected by the policy, so no further check here.
        for (backup_id, decision) in &decisions {
            if !decision.is_delete() {
                continue;
            }
            ctx.checkpoint()?;
            self.delete_locked(&ctx.for_backup(backup_id), true, false).await?;
            report.deleted.push(backup_id.clone());
        }

        report.sweep = Some(self.collector().sweep(ctx).await?);
        info!(scope, deleted = report.deleted.len(), "Purge finished");
        Ok(report)
    }

    /// Garbage-collect the configured scope without applying retention.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let scope = self.config.backup.scope.clone();
        let ctx = self.lock_scope("sweep", &scope, cancel).await?;
        let result = self.collector().sweep(&ctx).await;
        self.release_scope(&ctx).await;
        result
    }
}
