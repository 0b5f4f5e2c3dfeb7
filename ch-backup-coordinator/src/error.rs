use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ch_backup::coordination::protocol::{ErrorBody, ErrorKind};
use ch_backup::BackupError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// Carried to the client as a typed error body.
    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match &self {
            AppError::BadRequest(m) => ErrorBody {
                error: m.clone(),
                kind: ErrorKind::BadRequest,
                subject: String::new(),
                holder: None,
            },
            AppError::Unauthorized => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "error": self.to_string() })),
                )
                    .into_response();
            }
            AppError::Backup(e) => {
                let body = ErrorBody::from_error(e);
                if body.kind == ErrorKind::Internal {
                    tracing::error!("Internal error: {e}");
                } else {
                    tracing::debug!("Request failed: {e}");
                }
                body
            }
        };
        let status =
            StatusCode::from_u16(body.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
