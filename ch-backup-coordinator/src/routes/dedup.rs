use super::ok;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ch_backup::coordination::protocol::*;
use ch_backup::dedup::{DedupIndex, Reserve};
use ch_backup::fs::digest::ContentHash;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

type Api<T> = Result<Json<T>, AppError>;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/commit", post(commit))
        .route("/release", post(release))
        .route("/references/add", post(add_reference))
        .route("/references/remove", post(remove_reference))
        .route("/records/{hash}", get(record))
        .route("/unreferenced", get(unreferenced))
        .route("/reservations/expire", post(expire))
        .route("/claims", post(claim))
        .route("/claims/finish", post(finish_deletion))
        .route("/backups", get(backups))
        .route("/backups/{backup_id}", delete(remove_backup))
}

fn lease(ms: u64) -> Result<Duration, AppError> {
    if ms == 0 {
        return Err(AppError::BadRequest("lease_ms must be positive".into()));
    }
    Ok(Duration::from_millis(ms))
}

async fn reserve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReserveRequest>,
) -> Api<Reserve> {
    let outcome = state
        .coordinator
        .try_reserve(&req.hash, lease(req.lease_ms)?)
        .await?;
    Ok(Json(outcome))
}

async fn commit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CommitRequest>,
) -> Api<RefcountResponse> {
    let refcount = state
        .coordinator
        .commit(&req.reservation, &req.object, &req.owner)
        .await?;
    Ok(Json(RefcountResponse { refcount }))
}

async fn release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseReservationRequest>,
) -> Api<Value> {
    state.coordinator.release(&req.reservation).await?;
    Ok(ok())
}

async fn add_reference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReferenceRequest>,
) -> Api<RefcountResponse> {
    let refcount = state.coordinator.add_reference(&req.hash, &req.owner).await?;
    Ok(Json(RefcountResponse { refcount }))
}

async fn remove_reference(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReferenceRequest>,
) -> Api<RefcountResponse> {
    let refcount = state
        .coordinator
        .remove_reference(&req.hash, &req.owner)
        .await?;
    Ok(Json(RefcountResponse { refcount }))
}

async fn record(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Api<RecordResponse> {
    let hash = ContentHash::parse(&hash).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let record = state.coordinator.record(&hash).await?;
    Ok(Json(RecordResponse { record }))
}

async fn unreferenced(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnreferencedQuery>,
) -> Api<HashesResponse> {
    let hashes = state.coordinator.unreferenced(query.limit.min(10_000)).await?;
    Ok(Json(HashesResponse { hashes }))
}

async fn expire(State(state): State<Arc<AppState>>) -> Api<ExpiredResponse> {
    let expired = state.coordinator.expire_stale().await?;
    if expired > 0 {
        tracing::info!(expired, "Expired stale reservations and claims");
    }
    Ok(Json(ExpiredResponse { expired }))
}

async fn claim(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> Api<ClaimResponse> {
    let claim = state
        .coordinator
        .claim_for_deletion(&req.hash, lease(req.lease_ms)?)
        .await?;
    Ok(Json(ClaimResponse { claim }))
}

async fn finish_deletion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinishDeletionRequest>,
) -> Api<FinishDeletionResponse> {
    let finished = state.coordinator.finish_deletion(&req.claim).await?;
    Ok(Json(FinishDeletionResponse { finished }))
}

async fn backups(State(state): State<Arc<AppState>>) -> Api<BackupsResponse> {
    let backups = state.coordinator.referencing_backups().await?;
    Ok(Json(BackupsResponse { backups }))
}

async fn remove_backup(
    State(state): State<Arc<AppState>>,
    Path(backup_id): Path<String>,
) -> Api<HashesResponse> {
    let hashes = state
        .coordinator
        .remove_backup_references(&backup_id)
        .await?;
    tracing::info!(%backup_id, unreferenced = hashes.len(), "Removed backup references");
    Ok(Json(HashesResponse { hashes }))
}
