//! Shared state between backup nodes: the dedup index and scope locks.

pub mod http;
pub mod protocol;
pub mod sqlite;

use crate::config::{Config, CoordinationMode};
use crate::dedup::{DedupIndex, MemoryDedupIndex};
use crate::lock::{LockCoordinator, MemoryLockCoordinator};
use crate::retry::RetryPolicy;
use crate::utils::errors::{BackupError, Result};
use std::sync::Arc;

pub use http::HttpCoordinator;
pub use sqlite::SqliteCoordinator;

/// The two coordination services every operation needs.
#[derive(Clone)]
pub struct Coordination {
    pub dedup: Arc<dyn DedupIndex>,
    pub locks: Arc<dyn LockCoordinator>,
}

impl Coordination {
    pub fn from_config(config: &Config) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let coordination = &config.coordination;
        match coordination.mode {
            CoordinationMode::Sqlite => {
                let coordinator = Arc::new(SqliteCoordinator::open(&coordination.db_path, retry)?);
                tracing::debug!(path = %coordination.db_path.display(), "Using SQLite coordination");
                Ok(Self {
                    dedup: coordinator.clone(),
                    locks: coordinator,
                })
            }
            CoordinationMode::Http => {
                let url = coordination
                    .url
                    .as_deref()
                    .ok_or_else(|| BackupError::Config("coordination.url is not set".into()))?;
                let coordinator = Arc::new(HttpCoordinator::new(
                    url,
                    coordination.token.as_deref(),
                    coordination.request_timeout,
                    retry,
                )?);
                tracing::debug!(url, "Using remote coordinator");
                Ok(Self {
                    dedup: coordinator.clone(),
                    locks: coordinator,
                })
            }
            CoordinationMode::Memory => {
                tracing::warn!("In-memory coordination: locks and dedup state are not shared");
                Ok(Self::in_memory())
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dedup: Arc::new(MemoryDedupIndex::new()),
            locks: Arc::new(MemoryLockCoordinator::new()),
        }
    }
}
