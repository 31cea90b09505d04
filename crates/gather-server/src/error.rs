use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use gather_shared::ValidationError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Socket has not joined")]
    NotJoined,

    #[error("Sender {claimed} does not match joined identity {joined}")]
    SenderMismatch { claimed: String, joined: String },
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::NotJoined | ServerError::SenderMismatch { .. } => StatusCode::FORBIDDEN,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
