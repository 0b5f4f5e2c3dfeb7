//! Held scope lock with background renewal.

use super::{Lease, LockCoordinator};
use crate::utils::errors::{BackupError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A lease that renews itself every third of its duration.
///
/// When renewal fails for good the guard marks itself lost and cancels the
/// operation token it was given, so in-flight work stops before it can commit.
pub struct LeaseGuard {
    coordinator: Arc<dyn LockCoordinator>,
    resource: String,
    lease: Mutex<Lease>,
    duration: Duration,
    lost: AtomicBool,
    operation: CancellationToken,
    stop: CancellationToken,
}

impl LeaseGuard {
    /// Acquire `resource` (waiting up to `wait`) and start renewing it.
    pub async fn acquire(
        coordinator: Arc<dyn LockCoordinator>,
        resource: &str,
        holder: &str,
        duration: Duration,
        wait: Duration,
        operation: CancellationToken,
    ) -> Result<Arc<Self>> {
        let lease = coordinator.acquire(resource, holder, duration, wait).await?;
        info!(resource, holder, expires_at = %lease.expires_at, "Acquired scope lock");

        let guard = Arc::new(Self {
            coordinator,
            resource: resource.to_string(),
            lease: Mutex::new(lease),
            duration,
            lost: AtomicBool::new(false),
            operation,
            stop: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&guard);
        let stop = guard.stop.clone();
        tokio::spawn(renew_loop(weak, stop, duration / 3));
        Ok(guard)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lease(&self) -> Lease {
        self.current()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// `LockLost` once renewal failed or the lease ran out on the wall clock.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_lost() || self.current().is_expired() {
            return Err(BackupError::LockLost(self.resource.clone()));
        }
        Ok(())
    }

    /// Stop renewing and release the lease.
    pub async fn release(&self) -> Result<()> {
        self.stop.cancel();
        let lease = self.current();
        self.coordinator.release(&lease).await?;
        debug!(resource = %self.resource, "Released scope lock");
        Ok(())
    }

    fn current(&self) -> Lease {
        self.lease.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn mark_lost(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            error!(resource = %self.resource, "Scope lock lost: {}", reason);
            self.operation.cancel();
        }
    }

    async fn renew_once(&self) -> bool {
        let lease = self.current();
        match self.coordinator.renew(&lease, self.duration).await {
            Ok(renewed) => {
                *self.lease.lock().unwrap_or_else(|p| p.into_inner()) = renewed;
                true
            }
            Err(BackupError::LockLost(_)) => {
                self.mark_lost("lease taken over or broken");
                false
            }
            Err(e) if lease.is_expired() => {
                self.mark_lost(&format!("lease expired while renewal kept failing: {e}"));
                false
            }
            Err(e) => {
                warn!(resource = %self.resource, "Lease renewal failed, will retry: {}", e);
                true
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn renew_loop(guard: Weak<LeaseGuard>, stop: CancellationToken, interval: Duration) {
    let interval = interval.max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(guard) = guard.upgrade() else {
            break;
        };
        if !guard.renew_once().await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Acquire, MemoryLockCoordinator};

    #[tokio::test]
    async fn renewal_keeps_lease_alive() {
        let locks: Arc<dyn LockCoordinator> = Arc::new(MemoryLockCoordinator::new());
        let guard = LeaseGuard::acquire(
            Arc::clone(&locks),
            "ch-backup/s",
            "node-a",
            Duration::from_millis(150),
            Duration::ZERO,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        guard.ensure_valid().unwrap();
        assert!(matches!(
            locks
                .try_acquire("ch-backup/s", "node-b", Duration::from_secs(1))
                .await
                .unwrap(),
            Acquire::Busy { .. }
        ));

        guard.release().await.unwrap();
        assert!(locks.holder("ch-backup/s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_lock_cancels_operation() {
        let locks: Arc<dyn LockCoordinator> = Arc::new(MemoryLockCoordinator::new());
        let operation = CancellationToken::new();
        let guard = LeaseGuard::acquire(
            Arc::clone(&locks),
            "ch-backup/s",
            "node-a",
            Duration::from_millis(90),
            Duration::ZERO,
            operation.clone(),
        )
        .await
        .unwrap();

        locks.break_lock("ch-backup/s").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), operation.cancelled())
            .await
            .expect("operation cancelled after lock loss");

        assert!(guard.is_lost());
        assert!(matches!(guard.ensure_valid(), Err(BackupError::LockLost(_))));
    }
}
