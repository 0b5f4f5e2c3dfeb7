//! Leased mutual exclusion per backup scope.
//!
//! A lease is held by one holder at a time and must be renewed before it
//! expires. An expired lease can be acquired by anyone; the previous holder
//! finds out on its next renew.

pub mod guard;
pub mod memory;

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use guard::LeaseGuard;
pub use memory::MemoryLockCoordinator;

/// Lock resource name for a backup scope.
pub fn scope_resource(scope: &str) -> String {
    format!("ch-backup/{scope}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: String,
    pub holder: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Acquire {
    Acquired { lease: Lease },
    Busy { holder: String, expires_at: DateTime<Utc> },
}

/// Current owner of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub resource: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Single attempt. An expired lease held by someone else is taken over.
    async fn try_acquire(&self, resource: &str, holder: &str, lease: Duration) -> Result<Acquire>;

    /// Extend a lease. `LockLost` if it expired and was taken, or was broken.
    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease>;

    /// Release if still ours; otherwise a no-op.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Live holder of `resource`, if any.
    async fn holder(&self, resource: &str) -> Result<Option<LockHolder>>;

    /// Forcibly remove whatever lease exists. Returns the removed holder.
    async fn break_lock(&self, resource: &str) -> Result<Option<LockHolder>>;

    /// Acquire, polling for up to `wait`. `LockBusy` when the wait runs out.
    async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Lease> {
        let started = tokio::time::Instant::now();
        loop {
            match self.try_acquire(resource, holder, lease).await? {
                Acquire::Acquired { lease } => {
                    tracing::debug!(resource, holder, "Lock acquired");
                    return Ok(lease);
                }
                Acquire::Busy {
                    holder: current,
                    expires_at,
                } => {
                    let elapsed = started.elapsed();
                    if elapsed >= wait {
                        return Err(BackupError::LockBusy {
                            resource: resource.to_string(),
                            holder: current,
                        });
                    }
                    let until_expiry = (expires_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let pause = until_expiry
                        .min(wait - elapsed)
                        .clamp(Duration::from_millis(10), Duration::from_secs(1));
                    tracing::debug!(resource, holder = %current, "Lock busy, waiting {:?}", pause);
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every `LockCoordinator` implementation must share.

    use super::*;

    const RES: &str = "ch-backup/test";

    async fn acquired(locks: &dyn LockCoordinator, holder: &str, lease: Duration) -> Lease {
        match locks.try_acquire(RES, holder, lease).await.unwrap() {
            Acquire::Acquired { lease } => lease,
            other => panic!("expected acquisition, got {other:?}"),
        }
    }

    pub async fn exclusive(locks: &dyn LockCoordinator) {
        let lease = acquired(locks, "node-a", Duration::from_secs(60)).await;
        match locks
            .try_acquire(RES, "node-b", Duration::from_secs(60))
            .await
            .unwrap()
        {
            Acquire::Busy { holder, .. } => assert_eq!(holder, "node-a"),
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(locks.holder(RES).await.unwrap().unwrap().holder, "node-a");

        locks.release(&lease).await.unwrap();
        locks.release(&lease).await.unwrap();
        assert!(locks.holder(RES).await.unwrap().is_none());
        acquired(locks, "node-b", Duration::from_secs(60)).await;
    }

    pub async fn expired_lease_is_taken_over(locks: &dyn LockCoordinator) {
        let stale = acquired(locks, "node-a", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = acquired(locks, "node-b", Duration::from_secs(60)).await;

        let err = locks.renew(&stale, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, BackupError::LockLost(_)));

        // The stale holder's release must not drop the new lease.
        locks.release(&stale).await.unwrap();
        assert_eq!(locks.holder(RES).await.unwrap().unwrap().holder, "node-b");
        locks.renew(&fresh, Duration::from_secs(60)).await.unwrap();
    }

    pub async fn renew_extends(locks: &dyn LockCoordinator) {
        let lease = acquired(locks, "node-a", Duration::from_secs(1)).await;
        let renewed = locks.renew(&lease, Duration::from_secs(120)).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(renewed.token, lease.token);
    }

    pub async fn break_lock_evicts(locks: &dyn LockCoordinator) {
        let lease = acquired(locks, "node-a", Duration::from_secs(60)).await;
        let removed = locks.break_lock(RES).await.unwrap().unwrap();
        assert_eq!(removed.holder, "node-a");
        assert!(locks.break_lock(RES).await.unwrap().is_none());
        assert!(matches!(
            locks.renew(&lease, Duration::from_secs(60)).await,
            Err(BackupError::LockLost(_))
        ));
    }

    pub async fn acquire_waits_then_gives_up(locks: &dyn LockCoordinator) {
        let _lease = acquired(locks, "node-a", Duration::from_secs(60)).await;
        let err = locks
            .acquire(RES, "node-b", Duration::from_secs(60), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::LockBusy { .. }));
    }

    pub async fn run_all(make: impl Fn() -> Box<dyn LockCoordinator>) {
        exclusive(make().as_ref()).await;
        expired_lease_is_taken_over(make().as_ref()).await;
        renew_extends(make().as_ref()).await;
        break_lock_evicts(make().as_ref()).await;
        acquire_waits_then_gives_up(make().as_ref()).await;
    }
}
