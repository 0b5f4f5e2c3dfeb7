pub mod dedup;
pub mod locks;

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/dedup", dedup::router())
        .nest("/locks", locks::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = &state.config.token {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Empty JSON object for calls with nothing to report.
pub(crate) fn ok() -> Json<Value> {
    Json(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use ch_backup::coordination::SqliteCoordinator;
    use ch_backup::fs::digest::ContentHash;
    use ch_backup::retry::RetryPolicy;
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("coordinator.db");
        let coordinator = Arc::new(SqliteCoordinator::open(&db_path, RetryPolicy::none()).unwrap());
        let config = AppConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            db_path,
            token: token.map(str::to_string),
            log_level: "info".into(),
        };
        (create_router(Arc::new(AppState::new(coordinator, config))), dir)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _dir) = app(Some("secret"));
        let (status, body) = call(&app, Method::GET, "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_token_when_configured() {
        let (app, _dir) = app(Some("secret"));
        let (status, _) = call(&app, Method::GET, "/api/dedup/backups", Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = axum::http::Request::builder()
            .uri("/api/dedup/backups")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reserve_commit_and_lookup() {
        let (app, _dir) = app(None);
        let hash = ContentHash::of(b"part file");
        let reserve = json!({ "hash": hash, "lease_ms": 60_000 });

        let (status, first) = call(&app, Method::POST, "/api/dedup/reserve", reserve.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["outcome"], "miss");

        let (_, second) = call(&app, Method::POST, "/api/dedup/reserve", reserve.clone()).await;
        assert_eq!(second["outcome"], "in_flight");

        let commit = json!({
            "reservation": first["reservation"],
            "object": { "key": hash.storage_key(), "compressed": true, "stored_size": 4 },
            "owner": { "backup_id": "b1", "entry": "db.t/all_1_1_0/data.bin" },
        });
        let (status, body) = call(&app, Method::POST, "/api/dedup/commit", commit.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refcount"], 1);

        // The same reservation cannot be committed twice.
        let (status, body) = call(&app, Method::POST, "/api/dedup/commit", commit).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "reservation_expired");

        let (_, hit) = call(&app, Method::POST, "/api/dedup/reserve", reserve).await;
        assert_eq!(hit["outcome"], "hit");

        let uri = format!("/api/dedup/records/{}", hash.as_str());
        let (_, record) = call(&app, Method::GET, &uri, Value::Null).await;
        assert_eq!(record["record"]["state"], "present");
        assert_eq!(record["record"]["refcount"], 1);

        let (_, removed) = call(&app, Method::DELETE, "/api/dedup/backups/b1", Value::Null).await;
        assert_eq!(removed["hashes"], json!([hash.as_str()]));
    }

    #[tokio::test]
    async fn malformed_hash_is_bad_request() {
        let (app, _dir) = app(None);
        let (status, body) =
            call(&app, Method::GET, "/api/dedup/records/not-a-hash", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn second_holder_is_told_who_holds_the_lock() {
        let (app, _dir) = app(None);
        let acquire = |holder: &str| {
            json!({ "resource": "ch-backup/shard-1", "holder": holder, "lease_ms": 30_000 })
        };

        let (status, first) = call(&app, Method::POST, "/api/locks/acquire", acquire("a")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["outcome"], "acquired");

        let (_, second) = call(&app, Method::POST, "/api/locks/acquire", acquire("b")).await;
        assert_eq!(second["outcome"], "busy");
        assert_eq!(second["holder"], "a");

        let resource = json!({ "resource": "ch-backup/shard-1" });
        let (_, broken) = call(&app, Method::POST, "/api/locks/break", resource.clone()).await;
        assert_eq!(broken["holder"]["holder"], "a");

        // The original holder finds out on renew.
        let renew = json!({ "lease": first["lease"], "lease_ms": 30_000 });
        let (status, body) = call(&app, Method::POST, "/api/locks/renew", renew).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["kind"], "lock_lost");

        let (_, holder) = call(&app, Method::POST, "/api/locks/holder", resource).await;
        assert!(holder["holder"].is_null());
    }
}
