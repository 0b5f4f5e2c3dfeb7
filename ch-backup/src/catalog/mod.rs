//! Durable backup manifests on the storage backend.
//!
//! A backup exists once its manifest has been written. Manifests are written
//! once; afterwards only their state changes (towards deletion).

pub mod manifest;

use crate::storage::{list_keys, StorageBackend, BACKUPS_PREFIX};
use crate::utils::errors::{BackupError, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use manifest::{
    BackupManifest, BackupState, BackupSummary, FileEntry, PartEntry, TableSnapshot,
};
use manifest::{backup_id_from_key, manifest_key};

#[derive(Clone)]
pub struct Catalog {
    storage: Arc<dyn StorageBackend>,
}

impl Catalog {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Persist a new manifest. `ManifestConflict` if a different one already
    /// exists. Atomic on backends with a conditional put; elsewhere two
    /// writers racing on one id can both succeed.
    pub async fn write(&self, manifest: &BackupManifest) -> Result<()> {
        let key = manifest_key(&manifest.backup_id);
        let data = Bytes::from(manifest.to_json()?);
        if !self.storage.put_new(&key, data.clone()).await? {
            // A retried put whose first attempt landed finds its own bytes.
            if self.storage.get(&key).await?.as_ref() != Some(&data) {
                return Err(BackupError::ManifestConflict(manifest.backup_id.clone()));
            }
            debug!(backup_id = %manifest.backup_id, "Manifest already written by an earlier attempt");
        }
        info!(
            backup_id = %manifest.backup_id,
            state = %manifest.state,
            files = manifest.file_count(),
            "Manifest written"
        );
        Ok(())
    }

    pub async fn read(&self, backup_id: &str) -> Result<BackupManifest> {
        match self.storage.get(&manifest_key(backup_id)).await? {
            Some(data) => BackupManifest::from_json(&data),
            None => Err(BackupError::BackupNotFound(backup_id.to_string())),
        }
    }

    /// Every readable manifest, oldest first. Unreadable manifests are logged
    /// and skipped.
    pub async fn manifests(&self) -> Result<Vec<BackupManifest>> {
        let keys: Vec<String> = list_keys(self.storage.as_ref(), BACKUPS_PREFIX)
            .try_collect()
            .await?;

        let mut manifests = Vec::new();
        for key in keys {
            let Some(backup_id) = backup_id_from_key(&key) else {
                continue;
            };
            match self.read(backup_id).await {
                Ok(manifest) => manifests.push(manifest),
                // Deleted between list and read.
                Err(BackupError::BackupNotFound(_)) => {}
                Err(e @ (BackupError::Serialization(_) | BackupError::Storage(_))) => {
                    warn!(backup_id, "Skipping unreadable manifest: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(manifests)
    }

    /// Ids of every manifest key, readable or not.
    pub async fn backup_ids(&self) -> Result<HashSet<String>> {
        let keys: Vec<String> = list_keys(self.storage.as_ref(), BACKUPS_PREFIX)
            .try_collect()
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| backup_id_from_key(k))
            .map(str::to_string)
            .collect())
    }

    /// Summaries ordered by creation time.
    pub async fn list(&self) -> Result<Vec<BackupSummary>> {
        Ok(self.manifests().await?.iter().map(BackupManifest::summary).collect())
    }

    /// Manifests of one scope, oldest first.
    pub async fn list_scope(&self, scope: &str) -> Result<Vec<BackupManifest>> {
        let mut manifests = self.manifests().await?;
        manifests.retain(|m| m.scope == scope);
        Ok(manifests)
    }

    /// Rewrite the manifest with a new tail-end state.
    pub async fn mark_state(&self, backup_id: &str, state: BackupState) -> Result<BackupManifest> {
        let mut manifest = self.read(backup_id).await?;
        if manifest.state == state {
            return Ok(manifest);
        }
        if !manifest.state.can_transition_to(state) {
            return Err(BackupError::PolicyViolation(format!(
                "backup {} cannot move from {} to {}",
                backup_id, manifest.state, state
            )));
        }
        debug!(backup_id, from = %manifest.state, to = %state, "Changing backup state");
        manifest.state = state;
        self.put(&manifest).await?;
        Ok(manifest)
    }

    /// Remove the manifest. Returns `false` when it was already gone.
    pub async fn delete(&self, backup_id: &str) -> Result<bool> {
        let removed = self.storage.delete(&manifest_key(backup_id)).await?;
        if removed {
            info!(backup_id, "Manifest removed");
        }
        Ok(removed)
    }

    async fn put(&self, manifest: &BackupManifest) -> Result<()> {
        let data = manifest.to_json()?;
        self.storage
            .put(&manifest_key(&manifest.backup_id), Bytes::from(data))
            .await
    }
}
