//! Error taxonomy for backup, restore and retention operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network hiccup or 5xx from the object store; retried by `RetryPolicy`.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Storage unavailable after {attempts} attempts ({op}): {message}")]
    StorageUnavailable {
        op: String,
        attempts: u32,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock on {resource} is held by {holder}")]
    LockBusy { resource: String, holder: String },

    #[error("Lease on {0} was lost")]
    LockLost(String),

    #[error("Manifest for backup {0} already exists")]
    ManifestConflict(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Dedup reservation for {0} expired")]
    DedupReservationExpired(String),

    #[error("Dedup record for {0} is not available")]
    DedupRecordUnavailable(String),

    #[error("Restore incomplete: {0}")]
    RestoreIncomplete(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Coordination error: {message}")]
    Coordination { message: String, transient: bool },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl BackupError {
    pub fn coordination(message: impl Into<String>) -> Self {
        BackupError::Coordination {
            message: message.into(),
            transient: false,
        }
    }

    pub fn coordination_transient(message: impl Into<String>) -> Self {
        BackupError::Coordination {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::TransientStorage(_) => true,
            BackupError::Coordination { transient, .. } => *transient,
            BackupError::Io(e) => is_retryable_io(e),
            BackupError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map(|s| s.as_u16() == 429 || s.is_server_error())
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

impl From<rusqlite::Error> for BackupError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                BackupError::coordination_transient(format!("sqlite: {e}"))
            }
            other => BackupError::coordination(format!("sqlite: {other}")),
        }
    }
}

impl From<r2d2::Error> for BackupError {
    fn from(e: r2d2::Error) -> Self {
        BackupError::coordination_transient(format!("connection pool: {e}"))
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            BackupError::Cancelled("task aborted".into())
        } else {
            BackupError::Storage(format!("worker task panicked: {e}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
