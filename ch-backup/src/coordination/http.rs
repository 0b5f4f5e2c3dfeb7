//! Client for `ch-backup-coordinator`.

use super::protocol::*;
use crate::dedup::{
    BackupReferences, DedupIndex, DedupRecord, DeletionClaim, RefOwner, Reservation, Reserve,
    StoredObject,
};
use crate::fs::digest::ContentHash;
use crate::lock::{Acquire, Lease, LockCoordinator, LockHolder};
use crate::retry::RetryPolicy;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub struct HttpCoordinator {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    retry: RetryPolicy,
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

impl HttpCoordinator {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: token.map(str::to_string),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned + Send>(
        &self,
        op: &str,
        build: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> Result<T> {
        self.retry
            .run(op, || async {
                let mut req = build();
                if let Some(token) = &self.token {
                    req = req.bearer_auth(token);
                }
                let resp = req.send().await.map_err(|e| {
                    if e.is_timeout() || e.is_connect() || e.is_request() {
                        BackupError::coordination_transient(format!("{op}: {e}"))
                    } else {
                        BackupError::Http(e)
                    }
                })?;
                decode(op, resp).await
            })
            .await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned + Send>(
        &self,
        op: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path);
        self.call(op, || self.client.post(&url).json(body)).await
    }

    async fn get<T: DeserializeOwned + Send>(&self, op: &str, path: &str) -> Result<T> {
        let url = self.url(path);
        self.call(op, || self.client.get(&url)).await
    }
}

async fn decode<T: DeserializeOwned>(op: &str, resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| BackupError::coordination(format!("{op}: bad response: {e}")));
    }

    let text = resp.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return Err(body.into_error());
    }
    let message = format!("{op}: HTTP {status}: {text}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(BackupError::coordination_transient(message))
    } else {
        Err(BackupError::coordination(message))
    }
}

#[async_trait]
impl DedupIndex for HttpCoordinator {
    async fn try_reserve(&self, hash: &ContentHash, lease: Duration) -> Result<Reserve> {
        let body = ReserveRequest {
            hash: hash.clone(),
            lease_ms: millis(lease),
        };
        self.post("dedup reserve", "/api/dedup/reserve", &body).await
    }

    async fn commit(
        &self,
        reservation: &Reservation,
        object: &StoredObject,
        owner: &RefOwner,
    ) -> Result<u64> {
        let body = CommitRequest {
            reservation: reservation.clone(),
            object: object.clone(),
            owner: owner.clone(),
        };
        let resp: RefcountResponse = self.post("dedup commit", "/api/dedup/commit", &body).await?;
        Ok(resp.refcount)
    }

    async fn release(&self, reservation: &Reservation) -> Result<()> {
        let body = ReleaseReservationRequest {
            reservation: reservation.clone(),
        };
        let _: serde_json::Value = self
            .post("dedup release", "/api/dedup/release", &body)
            .await?;
        Ok(())
    }

    async fn add_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let body = ReferenceRequest {
            hash: hash.clone(),
            owner: owner.clone(),
        };
        let resp: RefcountResponse = self
            .post("dedup add reference", "/api/dedup/references/add", &body)
            .await?;
        Ok(resp.refcount)
    }

    async fn remove_reference(&self, hash: &ContentHash, owner: &RefOwner) -> Result<u64> {
        let body = ReferenceRequest {
            hash: hash.clone(),
            owner: owner.clone(),
        };
        let resp: RefcountResponse = self
            .post("dedup remove reference", "/api/dedup/references/remove", &body)
            .await?;
        Ok(resp.refcount)
    }

    async fn record(&self, hash: &ContentHash) -> Result<Option<DedupRecord>> {
        let resp: RecordResponse = self
            .get("dedup record", &format!("/api/dedup/records/{hash}"))
            .await?;
        Ok(resp.record)
    }

    async fn unreferenced(&self, limit: usize) -> Result<Vec<ContentHash>> {
        let resp: HashesResponse = self
            .get(
                "dedup unreferenced",
                &format!("/api/dedup/unreferenced?limit={limit}"),
            )
            .await?;
        Ok(resp.hashes)
    }

    async fn expire_stale(&self) -> Result<usize> {
        let resp: ExpiredResponse = self
            .post(
                "dedup expire",
                "/api/dedup/reservations/expire",
                &serde_json::json!({}),
            )
            .await?;
        Ok(resp.expired)
    }

    async fn claim_for_deletion(
        &self,
        hash: &ContentHash,
        lease: Duration,
    ) -> Result<Option<DeletionClaim>> {
        let body = ClaimRequest {
            hash: hash.clone(),
            lease_ms: millis(lease),
        };
        let resp: ClaimResponse = self.post("dedup claim", "/api/dedup/claims", &body).await?;
        Ok(resp.claim)
    }

    async fn finish_deletion(&self, claim: &DeletionClaim) -> Result<bool> {
        let body = FinishDeletionRequest {
            claim: claim.clone(),
        };
        let resp: FinishDeletionResponse = self
            .post("dedup finish deletion", "/api/dedup/claims/finish", &body)
            .await?;
        Ok(resp.finished)
    }

    async fn referencing_backups(&self) -> Result<Vec<BackupReferences>> {
        let resp: BackupsResponse = self.get("dedup backups", "/api/dedup/backups").await?;
        Ok(resp.backups)
    }

    async fn remove_backup_references(&self, backup_id: &str) -> Result<Vec<ContentHash>> {
        let url = self.url(&format!("/api/dedup/backups/{backup_id}"));
        let resp: HashesResponse = self
            .call("dedup remove backup", || self.client.delete(&url))
            .await?;
        Ok(resp.hashes)
    }
}

#[async_trait]
impl LockCoordinator for HttpCoordinator {
    async fn try_acquire(&self, resource: &str, holder: &str, lease: Duration) -> Result<Acquire> {
        let body = AcquireRequest {
            resource: resource.to_string(),
            holder: holder.to_string(),
            lease_ms: millis(lease),
        };
        self.post("lock acquire", "/api/locks/acquire", &body).await
    }

    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease> {
        let body = RenewRequest {
            lease: lease.clone(),
            lease_ms: millis(duration),
        };
        self.post("lock renew", "/api/locks/renew", &body).await
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let body = ReleaseLockRequest {
            lease: lease.clone(),
        };
        let _: serde_json::Value = self
            .post("lock release", "/api/locks/release", &body)
            .await?;
        Ok(())
    }

    async fn holder(&self, resource: &str) -> Result<Option<LockHolder>> {
        let body = ResourceRequest {
            resource: resource.to_string(),
        };
        let resp: HolderResponse = self.post("lock holder", "/api/locks/holder", &body).await?;
        Ok(resp.holder)
    }

    async fn break_lock(&self, resource: &str) -> Result<Option<LockHolder>> {
        let body = ResourceRequest {
            resource: resource.to_string(),
        };
        let resp: HolderResponse = self.post("lock break", "/api/locks/break", &body).await?;
        Ok(resp.holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_coordinator_is_transient() {
        let client = HttpCoordinator::new(
            "http://127.0.0.1:9",
            None,
            Duration::from_secs(2),
            RetryPolicy::none(),
        )
        .unwrap();
        let err = client
            .try_reserve(&ContentHash::of(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackupError::Coordination { transient: false, .. }),
            "{err}"
        );
    }
}
