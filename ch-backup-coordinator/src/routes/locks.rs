use super::ok;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use ch_backup::coordination::protocol::{
    AcquireRequest, HolderResponse, ReleaseLockRequest, RenewRequest, ResourceRequest,
};
use ch_backup::lock::{Acquire, Lease, LockCoordinator};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

type Api<T> = Result<Json<T>, AppError>;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/acquire", post(acquire))
        .route("/renew", post(renew))
        .route("/release", post(release))
        .route("/holder", post(holder))
        .route("/break", post(break_lock))
}

fn check_resource(resource: &str) -> Result<(), AppError> {
    if resource.is_empty() || resource.len() > 512 {
        return Err(AppError::BadRequest(format!("invalid resource: '{resource}'")));
    }
    Ok(())
}

async fn acquire(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> Api<Acquire> {
    check_resource(&req.resource)?;
    if req.lease_ms == 0 || req.holder.is_empty() {
        return Err(AppError::BadRequest("holder and lease_ms are required".into()));
    }
    let outcome = state
        .coordinator
        .try_acquire(&req.resource, &req.holder, Duration::from_millis(req.lease_ms))
        .await?;
    if let Acquire::Acquired { lease } = &outcome {
        tracing::info!(resource = %lease.resource, holder = %lease.holder, "Lock granted");
    }
    Ok(Json(outcome))
}

async fn renew(State(state): State<Arc<AppState>>, Json(req): Json<RenewRequest>) -> Api<Lease> {
    let lease = state
        .coordinator
        .renew(&req.lease, Duration::from_millis(req.lease_ms))
        .await?;
    Ok(Json(lease))
}

async fn release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseLockRequest>,
) -> Api<Value> {
    state.coordinator.release(&req.lease).await?;
    tracing::info!(resource = %req.lease.resource, holder = %req.lease.holder, "Lock released");
    Ok(ok())
}

async fn holder(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResourceRequest>,
) -> Api<HolderResponse> {
    check_resource(&req.resource)?;
    let holder = state.coordinator.holder(&req.resource).await?;
    Ok(Json(HolderResponse { holder }))
}

async fn break_lock(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResourceRequest>,
) -> Api<HolderResponse> {
    check_resource(&req.resource)?;
    let holder = state.coordinator.break_lock(&req.resource).await?;
    if let Some(h) = &holder {
        tracing::warn!(resource = %req.resource, holder = %h.holder, "Lock broken");
    }
    Ok(Json(HolderResponse { holder }))
}
