use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use ota_common::models::FileInfo;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Small local API so software on the robot can hand files to the upload
/// queue and probe daemon liveness.
pub fn make_router(upload_send: mpsc::Sender<Vec<FileInfo>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .layer(Extension(upload_send))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "OTA Daemon: Running" }))
}

async fn upload(
    Extension(upload_send): Extension<mpsc::Sender<Vec<FileInfo>>>,
    Json(files): Json<Vec<FileInfo>>,
) -> StatusCode {
    match upload_send.send(files).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
