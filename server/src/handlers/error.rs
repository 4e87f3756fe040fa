use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::persistence::PersistenceError;

/// Errors surfaced over the HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    /// Per-file outcomes of a batch endpoint where at least one entry failed.
    #[error("one or more files failed")]
    Batch(Vec<Value>),
    #[error(transparent)]
    Service(#[from] crate::error::Error),
}

impl From<PersistenceError> for Error {
    fn from(error: PersistenceError) -> Self {
        Self::Service(error.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, json!(detail)),
            Self::Validation(detail) => (StatusCode::BAD_REQUEST, json!(detail)),
            Self::Batch(detail) => (StatusCode::BAD_REQUEST, json!(detail)),
            Self::Service(error) => (StatusCode::BAD_REQUEST, json!(error.to_string())),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
