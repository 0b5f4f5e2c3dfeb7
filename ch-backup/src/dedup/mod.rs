//! Cluster-wide content deduplication index.
//!
//! One record per content hash. A record moves through
//! `reserved -> present -> deleting -> (gone)`; the uploader holding a
//! reservation is the only writer of that hash's object until it commits or
//! the reservation lease expires. References are tagged with their owner
//! (`backup_id`, `entry`), so adding or removing the same reference twice is a
//! no-op and the refcount is the number of distinct owners.

pub mod memory;

use crate::fs::digest::ContentHash;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryDedupIndex;

/// Where a piece of content physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub compressed: bool,
    pub stored_size: u64,
}

/// Identity of one reference: a backup and the manifest entry inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefOwner {
    pub backup_id: String,
    pub entry: String,
}

impl RefOwner {
    pub fn new(backup_id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            entry: entry.into(),
        }
    }
}

/// Exclusive right to upload one hash until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub hash: ContentHash,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reserve {
    /// Content already stored; add a reference instead of uploading.
    Hit { object: StoredObject },
    /// Caller must upload, then `commit` or `release`.
    Miss { reservation: Reservation },
    /// Someone else is uploading or deleting this hash.
    InFlight { expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Reserved,
    Present,
    Deleting,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Reserved => "reserved",
            RecordState::Present => "present",
            RecordState::Deleting => "deleting",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reserved" => Ok(RecordState::Reserved),
            "present" => Ok(RecordState::Present),
            "deleting" => Ok(RecordState::Deleting),
            other => Err(BackupError::coordination(format!("unknown record state: {other}"))),
        }
    }
}

/// Read-only view of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub hash: ContentHash,
    pub state: RecordState,
    pub object: Option<StoredObject>,
    pub refcount: u64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_referenced_at: Option<DateTime<Utc>>,
}

/// Exclusive right to delete one hash's object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionClaim {
    pub hash: ContentHash,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Location recorded at claim time; `None` when no record existed.
    pub object: Option<StoredObject>,
}

impl DeletionClaim {
    /// Object key to delete, falling back to the content-addressed layout.
    pub fn storage_key(&self) -> String {
        self.object
            .as_ref()
            .map(|o| o.key.clone())
            .unwrap_or_else(|| self.hash.storage_key())
    }
}

/// Per-backup reference summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupReferences {
    pub backup_id: String,
    pub refs: u64,
    pub last_referenced_at: DateTime<Utc>,
}

#[async_trait]
pub trait DedupIndex: Send + Sync {
    /// One non-blocking step of the lookup protocol.
    ///
    /// A present record is a hit even with zero references. A reserved record
    /// or deletion claim whose lease has run out is taken over.
    async fn try_reserve(&self, hash: &ContentHash, lease: Duration) -> Result<Reserve>;

    /// Turn a reservation into a present record owned by `owner`. Fails with
    /// `DedupReservationExpired` when the reservation was taken over.
    /// Returns the new refcount.
    async fn commit(
        &self,
        reservation: &Reservation,
        object: &StoredObject,
        owner: &RefOwner,
    ) -> Result<u64>;

    /// Drop an uncommitted reservation. No-op if it is no longer ours.
    async fn release(&self, reservation: &Reservation) -> Result<()>;

    /// Reference a present record. `DedupRecordUnavailable` when the record is
    /// missing, reserved or being deleted.
    async fn add_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64>;

    /// Remove one reference; missing references and records are fine.
    async fn remove_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64>;

    async fn record(&self, hash: &ContentHash) -> Result<Option<DedupRecord>>;

    /// Location of a present record.
    async fn resolve(&self, hash: &ContentHash) -> Result<Option<StoredObject>> {
        Ok(self
            .record(hash)
            .await?
            .filter(|r| r.state == RecordState::Present)
            .and_then(|r| r.object))
    }

    /// Present records with no references.
    async fn unreferenced(&self, limit: usize) -> Result<Vec<ContentHash>>;

    /// Drop reservations and deletion claims whose lease ran out.
    async fn expire_stale(&self) -> Result<usize>;

    /// Claim a hash for physical deletion. Succeeds for a present record with
    /// zero references, for a hash with no record, and for an expired claim.
    async fn claim_for_deletion(
        &self,
        hash: &ContentHash,
        lease: Duration,
    ) -> Result<Option<DeletionClaim>>;

    /// Remove the record once its object is gone. Returns `false` when the
    /// claim had been taken over.
    async fn finish_deletion(&self, claim: &DeletionClaim) -> Result<bool>;

    async fn referencing_backups(&self) -> Result<Vec<BackupReferences>>;

    /// Remove every reference owned by `backup_id`. Returns hashes whose
    /// refcount dropped to zero.
    async fn remove_backup_references(&self, backup_id: &str) -> Result<Vec<ContentHash>>;

    /// Poll [`try_reserve`](Self::try_reserve) until the outcome is a hit or a
    /// reservation for the caller.
    async fn lookup_or_reserve(
        &self,
        hash: &ContentHash,
        lease: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Reserve> {
        loop {
            match self.try_reserve(hash, lease).await? {
                Reserve::InFlight { expires_at } => {
                    let until_expiry = (expires_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let wait = poll.min(until_expiry).max(Duration::from_millis(10));
                    tracing::debug!(hash = %hash, ?wait, "Content upload in flight elsewhere, waiting");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(BackupError::Cancelled(format!("waiting for {hash}")));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                outcome => return Ok(outcome),
            }
        }
    }
}
