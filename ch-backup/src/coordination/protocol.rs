//! JSON bodies exchanged with `ch-backup-coordinator`.

use crate::dedup::{BackupReferences, DedupRecord, DeletionClaim, RefOwner, Reservation, StoredObject};
use crate::fs::digest::ContentHash;
use crate::lock::{Lease, LockHolder};
use crate::utils::errors::BackupError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub hash: ContentHash,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub reservation: Reservation,
    pub object: StoredObject,
    pub owner: RefOwner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReservationRequest {
    pub reservation: Reservation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRequest {
    pub hash: ContentHash,
    pub owner: RefOwner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefcountResponse {
    pub refcount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResponse {
    pub record: Option<DedupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreferencedQuery {
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashesResponse {
    pub hashes: Vec<ContentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiredResponse {
    pub expired: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub hash: ContentHash,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub claim: Option<DeletionClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishDeletionRequest {
    pub claim: DeletionClaim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishDeletionResponse {
    pub finished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupsResponse {
    pub backups: Vec<BackupReferences>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub resource: String,
    pub holder: String,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub lease: Lease,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub lease: Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderResponse {
    pub holder: Option<LockHolder>,
}

/// Error categories that survive the trip over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ReservationExpired,
    RecordUnavailable,
    LockLost,
    LockBusy,
    BadRequest,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn of(err: &BackupError) -> Self {
        match err {
            BackupError::DedupReservationExpired(_) => ErrorKind::ReservationExpired,
            BackupError::DedupRecordUnavailable(_) => ErrorKind::RecordUnavailable,
            BackupError::LockLost(_) => ErrorKind::LockLost,
            BackupError::LockBusy { .. } => ErrorKind::LockBusy,
            BackupError::Config(_) | BackupError::Serialization(_) => ErrorKind::BadRequest,
            e if e.is_transient() => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// HTTP status the coordinator answers with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::ReservationExpired | ErrorKind::RecordUnavailable | ErrorKind::LockBusy => {
                409
            }
            ErrorKind::LockLost => 410,
            ErrorKind::BadRequest => 400,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    /// Subject of the error (hash or resource) so the client can rebuild it.
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &BackupError) -> Self {
        let subject = match err {
            BackupError::DedupReservationExpired(s)
            | BackupError::DedupRecordUnavailable(s)
            | BackupError::LockLost(s) => s.clone(),
            BackupError::LockBusy { resource, .. } => resource.clone(),
            _ => String::new(),
        };
        let holder = match err {
            BackupError::LockBusy { holder, .. } => Some(holder.clone()),
            _ => None,
        };
        Self {
            error: err.to_string(),
            kind: ErrorKind::of(err),
            subject,
            holder,
        }
    }

    pub fn into_error(self) -> BackupError {
        match self.kind {
            ErrorKind::ReservationExpired => BackupError::DedupReservationExpired(self.subject),
            ErrorKind::RecordUnavailable => BackupError::DedupRecordUnavailable(self.subject),
            ErrorKind::LockLost => BackupError::LockLost(self.subject),
            ErrorKind::LockBusy => BackupError::LockBusy {
                resource: self.subject,
                holder: self.holder.unwrap_or_default(),
            },
            ErrorKind::Unavailable => BackupError::coordination_transient(self.error),
            ErrorKind::BadRequest | ErrorKind::Internal => BackupError::coordination(self.error),
        }
    }
}
