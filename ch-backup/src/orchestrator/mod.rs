//! Backup state machine: create, restore, delete, purge and sweep.
//!
//! Every mutating operation runs under the scope lock of the backup it
//! touches. Restore only reads and never takes the lock.

pub mod context;
pub mod create;
pub mod delete;
pub mod purge;
pub mod restore;

#[cfg(test)]
mod scenarios;

use crate::catalog::{BackupManifest, BackupState, BackupSummary, Catalog};
use crate::config::Config;
use crate::coordination::Coordination;
use crate::database::{ClickHouseClient, DatabaseClient};
use crate::lock::{scope_resource, LeaseGuard, LockHolder};
use crate::retention::GarbageCollector;
use crate::storage::{backend_from_config, StorageBackend};
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use context::OperationContext;
pub use create::{CreateOptions, CreateReport};
pub use delete::DeleteReport;
pub use purge::PurgeReport;
pub use restore::{RestoreOptions, RestoreReport};

/// Lexicographically sortable id: `20260102T030405-1a2b3c4d`.
pub fn new_backup_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

pub struct Orchestrator {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    catalog: Catalog,
    coordination: Coordination,
    database: Arc<dyn DatabaseClient>,
    holder: String,
    hostname: String,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        coordination: Coordination,
        database: Arc<dyn DatabaseClient>,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            holder: config.holder_id(),
            catalog: Catalog::new(Arc::clone(&storage)),
            config,
            storage,
            coordination,
            database,
            hostname,
        }
    }

    /// Wire up storage, coordination and ClickHouse from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let storage = backend_from_config(&config)?;
        let coordination = Coordination::from_config(&config)?;
        let database: Arc<dyn DatabaseClient> =
            Arc::new(ClickHouseClient::new(&config.clickhouse)?);
        Ok(Self::new(config, storage, coordination, database))
    }

    /// Override the lease holder identity.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub async fn list(&self) -> Result<Vec<BackupSummary>> {
        self.catalog.list().await
    }

    pub async fn show(&self, backup_id: &str) -> Result<BackupManifest> {
        self.catalog.read(backup_id).await
    }

    /// Forcibly remove the configured scope's lock.
    pub async fn break_lock(&self) -> Result<Option<LockHolder>> {
        let resource = scope_resource(&self.config.backup.scope);
        let previous = self.coordination.locks.break_lock(&resource).await?;
        match &previous {
            Some(holder) => warn!(resource, holder = %holder.holder, "Scope lock broken"),
            None => debug!(resource, "Scope lock was not held"),
        }
        Ok(previous)
    }

    /// Acquire the scope lock and build the context the operation runs in.
    async fn lock_scope(
        &self,
        backup_id: &str,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<OperationContext> {
        let operation = cancel.child_token();
        let coordination = &self.config.coordination;
        let guard = LeaseGuard::acquire(
            Arc::clone(&self.coordination.locks),
            &scope_resource(scope),
            &self.holder,
            coordination.lock_lease,
            coordination.lock_wait,
            operation.clone(),
        )
        .await?;
        Ok(OperationContext::new(
            backup_id,
            scope,
            self.config.backup.operation_timeout,
            operation,
        )
        .with_guard(guard))
    }

    async fn release_scope(&self, ctx: &OperationContext) {
        if let Some(guard) = ctx.guard() {
            if let Err(e) = guard.release().await {
                // The lease expires on its own.
                warn!(resource = guard.resource(), "Failed to release scope lock: {}", e);
            }
        }
    }

    fn collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.coordination.dedup),
            self.catalog.clone(),
            &self.config,
        )
    }
}

/// Move `state` forward, refusing illegal transitions.
pub(crate) fn advance(ctx: &OperationContext, state: &mut BackupState, next: BackupState) -> Result<()> {
    if !state.can_transition_to(next) {
        return Err(BackupError::PolicyViolation(format!(
            "backup {} cannot move from {} to {}",
            ctx.backup_id, state, next
        )));
    }
    debug!(backup_id = %ctx.backup_id, from = %state, to = %next, "Backup state");
    *state = next;
    Ok(())
}
