//! Dedup index and scope locks in one SQLite database.
//!
//! Every process that can open the database file (local disk or a shared
//! mount with working POSIX locks) sees the same state. The coordinator
//! service wraps the same type to serve nodes over HTTP.

pub mod connection;
mod dedup;
mod locks;
pub mod migrate;

use crate::dedup::{
    BackupReferences, DedupIndex, DedupRecord, DeletionClaim, RefOwner, Reservation, Reserve,
    StoredObject,
};
use crate::fs::digest::ContentHash;
use crate::lock::{Acquire, Lease, LockCoordinator, LockHolder};
use crate::retry::RetryPolicy;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use connection::DbPool;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Clone)]
pub struct SqliteCoordinator {
    pool: DbPool,
    retry: RetryPolicy,
}

impl SqliteCoordinator {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        let pool = connection::create_pool(path)?;
        migrate::migrate(&pool)?;
        Ok(Self { pool, retry })
    }

    /// Run `f` on a pooled connection off the async runtime. Busy databases
    /// are retried with the configured policy.
    async fn with_conn<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.retry
            .run(op, || {
                let pool = self.pool.clone();
                let f = Arc::clone(&f);
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut conn = pool.get()?;
                        (*f)(&mut *conn)
                    })
                    .await?
                }
            })
            .await
    }
}

#[async_trait]
impl DedupIndex for SqliteCoordinator {
    async fn try_reserve(&self, hash: &ContentHash, lease: Duration) -> Result<Reserve> {
        let hash = hash.clone();
        self.with_conn("dedup reserve", move |c| dedup::try_reserve(c, &hash, lease))
            .await
    }

    async fn commit(
        &self,
        reservation: &Reservation,
        object: &StoredObject,
        owner: &RefOwner,
    ) -> Result<u64> {
        let (reservation, object, owner) = (reservation.clone(), object.clone(), owner.clone());
        self.with_conn("dedup commit", move |c| {
            dedup::commit(c, &reservation, &object, &owner)
        })
        .await
    }

    async fn release(&self, reservation: &Reservation) -> Result<()> {
        let reservation = reservation.clone();
        self.with_conn("dedup release", move |c| dedup::release(c, &reservation))
            .await
    }

    async fn add_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let (hash, owner) = (hash.clone(), owner.clone());
        self.with_conn("dedup add reference", move |c| {
            dedup::add_reference(c, &hash, &owner)
        })
        .await
    }

    async fn remove_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let (hash, owner) = (hash.clone(), owner.clone());
        self.with_conn("dedup remove reference", move |c| {
            dedup::remove_reference(c, &hash, &owner)
        })
        .await
    }

    async fn record(&self, hash: &ContentHash) -> Result<Option<DedupRecord>> {
        let hash = hash.clone();
        self.with_conn("dedup record", move |c| dedup::record(c, &hash))
            .await
    }

    async fn unreferenced(&self, limit: usize) -> Result<Vec<ContentHash>> {
        self.with_conn("dedup unreferenced", move |c| dedup::unreferenced(c, limit))
            .await
    }

    async fn expire_stale(&self) -> Result<usize> {
        self.with_conn("dedup expire", dedup::expire_stale).await
    }

    async fn claim_for_deletion(
        &self,
        hash: &ContentHash,
        lease: Duration,
    ) -> Result<Option<DeletionClaim>> {
        let hash = hash.clone();
        self.with_conn("dedup claim", move |c| {
            dedup::claim_for_deletion(c, &hash, lease)
        })
        .await
    }

    async fn finish_deletion(&self, claim: &DeletionClaim) -> Result<bool> {
        let claim = claim.clone();
        self.with_conn("dedup finish deletion", move |c| {
            dedup::finish_deletion(c, &claim)
        })
        .await
    }

    async fn referencing_backups(&self) -> Result<Vec<BackupReferences>> {
        self.with_conn("dedup backups", dedup::referencing_backups)
            .await
    }

    async fn remove_backup_references(&self, backup_id: &str) -> Result<Vec<ContentHash>> {
        let backup_id = backup_id.to_string();
        self.with_conn("dedup remove backup", move |c| {
            dedup::remove_backup_references(c, &backup_id)
        })
        .await
    }
}

#[async_trait]
impl LockCoordinator for SqliteCoordinator {
    async fn try_acquire(&self, resource: &str, holder: &str, lease: Duration) -> Result<Acquire> {
        let (resource, holder) = (resource.to_string(), holder.to_string());
        self.with_conn("lock acquire", move |c| {
            locks::try_acquire(c, &resource, &holder, lease)
        })
        .await
    }

    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease> {
        let lease = lease.clone();
        self.with_conn("lock renew", move |c| locks::renew(c, &lease, duration))
            .await
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let lease = lease.clone();
        self.with_conn("lock release", move |c| locks::release(c, &lease))
            .await
    }

    async fn holder(&self, resource: &str) -> Result<Option<LockHolder>> {
        let resource = resource.to_string();
        self.with_conn("lock holder", move |c| locks::holder(c, &resource))
            .await
    }

    async fn break_lock(&self, resource: &str) -> Result<Option<LockHolder>> {
        let resource = resource.to_string();
        self.with_conn("lock break", move |c| locks::break_lock(c, &resource))
            .await
    }
}
