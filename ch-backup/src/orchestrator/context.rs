//! Per-operation state threaded through create, restore, delete and sweep.

use crate::lock::LeaseGuard;
use crate::utils::errors::{BackupError, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct OperationContext {
    pub backup_id: String,
    pub scope: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    guard: Option<Arc<LeaseGuard>>,
}

impl OperationContext {
    pub fn new(
        backup_id: impl Into<String>,
        scope: impl Into<String>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            scope: scope.into(),
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
            guard: None,
        }
    }

    /// Attach the scope lock the operation runs under.
    pub fn with_guard(mut self, guard: Arc<LeaseGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Same operation, different subject (purge deleting several backups).
    pub fn for_backup(&self, backup_id: &str) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            ..self.clone()
        }
    }

    /// A context whose cancellation does not propagate to `self`, used to stop
    /// sibling tasks after the first failure.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn guard(&self) -> Option<&Arc<LeaseGuard>> {
        self.guard.as_ref()
    }

    /// Fail when the operation was cancelled, ran past its deadline, or lost
    /// its scope lock. Called before every externally visible side effect.
    pub fn checkpoint(&self) -> Result<()> {
        if let Some(guard) = &self.guard {
            guard.ensure_valid()?;
        }
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled(self.backup_id.clone()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel.cancel();
                return Err(BackupError::Cancelled(format!(
                    "{}: operation timeout exceeded",
                    self.backup_id
                )));
            }
        }
        Ok(())
    }

    /// Run `fut`, giving up early when the operation is cancelled.
    pub async fn run<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => {
                self.checkpoint()?;
                Err(BackupError::Cancelled(self.backup_id.clone()))
            }
        }
    }
}

/// Wait for worker tasks in completion order. The first failure cancels
/// `tasks` so the remaining workers stop; the error that caused the stop is
/// reported rather than the cancellations it triggered.
pub(crate) async fn join_workers<T>(
    tasks: &OperationContext,
    handles: Vec<JoinHandle<Result<T>>>,
) -> Result<Vec<T>> {
    let mut pending: FuturesUnordered<_> = handles.into_iter().collect();
    let mut done = Vec::with_capacity(pending.len());
    let mut first_error: Option<BackupError> = None;

    while let Some(joined) = pending.next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(value) => done.push(value),
            Err(e) => {
                tasks.cancel_token().cancel();
                let replace = match &first_error {
                    None => true,
                    Some(BackupError::Cancelled(_)) => !matches!(e, BackupError::Cancelled(_)),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(done),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockCoordinator, MemoryLockCoordinator};

    #[test]
    fn cancelled_context_fails_checkpoint() {
        let token = CancellationToken::new();
        let ctx = OperationContext::new("b1", "s", None, token.clone());
        ctx.checkpoint().unwrap();
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(BackupError::Cancelled(_))));
    }

    #[tokio::test]
    async fn deadline_cancels_operation() {
        let token = CancellationToken::new();
        let ctx = OperationContext::new("b1", "s", Some(Duration::from_millis(10)), token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ctx.checkpoint().is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn lost_lock_reports_lock_lost() {
        let locks: Arc<dyn LockCoordinator> = Arc::new(MemoryLockCoordinator::new());
        let token = CancellationToken::new();
        let guard = LeaseGuard::acquire(
            Arc::clone(&locks),
            "ch-backup/s",
            "a",
            Duration::from_millis(90),
            Duration::ZERO,
            token.clone(),
        )
        .await
        .unwrap();
        let ctx = OperationContext::new("b1", "s", None, token.clone()).with_guard(guard);

        locks.break_lock("ch-backup/s").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert!(matches!(ctx.checkpoint(), Err(BackupError::LockLost(_))));
    }

    #[tokio::test]
    async fn late_failure_stops_earlier_workers() {
        let ctx = OperationContext::new("b1", "s", None, CancellationToken::new());
        let tasks = ctx.child();

        let slow_ctx = tasks.clone();
        let slow = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(1u32),
                _ = slow_ctx.cancel_token().cancelled() => Err(BackupError::Cancelled("b1".into())),
            }
        });
        let failing = tokio::spawn(async { Err(BackupError::Storage("disk full".into())) });

        let result = tokio::time::timeout(Duration::from_secs(5), join_workers(&tasks, vec![slow, failing]))
            .await
            .expect("first failure should stop the pool");
        assert!(matches!(result, Err(BackupError::Storage(_))));
        assert!(tasks.cancel_token().is_cancelled());
        // Sibling cancellation does not reach the operation.
        assert!(!ctx.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn workers_results_are_all_collected() {
        let ctx = OperationContext::new("b1", "s", None, CancellationToken::new());
        let handles = (0..4u32).map(|i| tokio::spawn(async move { Ok(i) })).collect();
        let mut done = join_workers(&ctx, handles).await.unwrap();
        done.sort();
        assert_eq!(done, vec![0, 1, 2, 3]);
    }
}
