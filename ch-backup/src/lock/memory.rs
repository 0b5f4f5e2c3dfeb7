use super::{Acquire, Lease, LockCoordinator, LockHolder};
use crate::utils::errors::{BackupError, Result};
use crate::utils::{deadline_after, new_token};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Held {
    lease: Lease,
    acquired_at: DateTime<Utc>,
}

impl Held {
    fn holder(&self) -> LockHolder {
        LockHolder {
            resource: self.lease.resource.clone(),
            holder: self.lease.holder.clone(),
            expires_at: self.lease.expires_at,
            acquired_at: self.acquired_at,
        }
    }
}

/// Locks that live only as long as the process.
#[derive(Default)]
pub struct MemoryLockCoordinator {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, Held>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockCoordinator {
    async fn try_acquire(&self, resource: &str, holder: &str, lease: Duration) -> Result<Acquire> {
        let mut held = self.held();
        if let Some(current) = held.get(resource) {
            if !current.lease.is_expired() {
                return Ok(Acquire::Busy {
                    holder: current.lease.holder.clone(),
                    expires_at: current.lease.expires_at,
                });
            }
        }
        let lease = Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            token: new_token(),
            expires_at: deadline_after(lease),
        };
        held.insert(
            resource.to_string(),
            Held {
                lease: lease.clone(),
                acquired_at: Utc::now(),
            },
        );
        Ok(Acquire::Acquired { lease })
    }

    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease> {
        let mut held = self.held();
        match held.get_mut(&lease.resource) {
            // An expired lease nobody took over yet is still ours to renew.
            Some(current) if current.lease.token == lease.token => {
                current.lease.expires_at = deadline_after(duration);
                Ok(current.lease.clone())
            }
            _ => Err(BackupError::LockLost(lease.resource.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut held = self.held();
        if held
            .get(&lease.resource)
            .is_some_and(|c| c.lease.token == lease.token)
        {
            held.remove(&lease.resource);
        }
        Ok(())
    }

    async fn holder(&self, resource: &str) -> Result<Option<LockHolder>> {
        Ok(self
            .held()
            .get(resource)
            .filter(|c| !c.lease.is_expired())
            .map(Held::holder))
    }

    async fn break_lock(&self, resource: &str) -> Result<Option<LockHolder>> {
        Ok(self.held().remove(resource).map(|c| c.holder()))
    }
}
