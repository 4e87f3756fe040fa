mod error;

pub use error::Error;
use error::Result;

use std::collections::BTreeMap;

use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path, Query};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use ota_common::models::{
    FileCreateList, FileDeployResponse, FileUpdate, FileUploadResponse, TaskState, DEFAULT_BUCKET,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::persistence::{Artifact, ArtifactFilter, DeployJob, DeployTarget, Persistence};
use crate::service::OtaService;

/// Uploads are buffered in memory; keep them bounded.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn make_router(service: OtaService, persistence: Persistence) -> Router {
    Router::new()
        .route("/file/list", get(file_list))
        .route("/file/upload", post(file_upload))
        .route("/file/update", patch(file_update))
        .route("/file/deploy", post(file_deploy))
        .route("/file/deploy_from_s3", post(file_deploy_from_s3))
        .route("/file/download", get(file_download))
        .route("/file/validate", put(file_validate))
        .route("/file/invalidate", put(file_invalidate))
        .route("/file/delete", delete(file_delete))
        .route("/deploy_state/:robot_id", get(deploy_state))
        .route("/job_state/:job_id", get(job_state))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(service))
        .layer(Extension(persistence))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    bucket: Option<String>,
    object_name: Option<String>,
    robot_id: Option<String>,
    robot_type: Option<String>,
    deploy_path: Option<String>,
    /// JSON object; every key/value is an AND predicate over the stored
    /// metadata.
    file_metadata: Option<String>,
}

async fn file_list(
    Extension(persistence): Extension<Persistence>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Artifact>>> {
    let file_metadata: BTreeMap<String, String> = match &params.file_metadata {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|error| Error::Validation(format!("invalid file_metadata filter: {error}")))?,
        None => BTreeMap::new(),
    };

    let filter = ArtifactFilter {
        bucket: params.bucket,
        object_name: params.object_name,
        robot_id: params.robot_id,
        robot_type: params.robot_type,
        deploy_path: params.deploy_path,
        file_metadata,
    };

    let artifacts = persistence.get_artifacts(&filter).await?;
    Ok(Json(artifacts))
}

struct UploadForm {
    info: FileCreateList,
    files: Vec<(Option<String>, Bytes)>,
}

/// Pulls the `file_info_list` JSON field and all `files` parts out of a
/// multipart request.
async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm> {
    let mut info = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| Error::Validation(error.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file_info_list") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|error| Error::Validation(error.to_string()))?;
                info = Some(serde_json::from_str(&raw).map_err(|error| {
                    Error::Validation(format!("invalid file_info_list: {error}"))
                })?);
            }
            Some("files") => {
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|error| Error::Validation(error.to_string()))?;
                files.push((file_name, data));
            }
            _ => {}
        }
    }

    let info = info.ok_or_else(|| Error::Validation("missing file_info_list field".to_string()))?;

    Ok(UploadForm { info, files })
}

fn batch_error<T: Serialize>(responses: &[T]) -> Error {
    Error::Batch(
        responses
            .iter()
            .map(|response| serde_json::to_value(response).unwrap_or(Value::Null))
            .collect(),
    )
}

async fn file_upload(
    Extension(service): Extension<OtaService>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileUploadResponse>>> {
    let form = read_upload_form(&mut multipart).await?;
    if form.files.len() != form.info.file_list.len() {
        return Err(Error::Validation(
            "number of files and file info do not match".to_string(),
        ));
    }

    let timestamp = Utc::now();
    let mut responses = Vec::with_capacity(form.files.len());

    for ((file_name, data), info) in form.files.into_iter().zip(form.info.file_list) {
        responses.push(service.upload_file(file_name, data, info, timestamp).await);
    }

    if responses
        .iter()
        .any(|response| response.state == TaskState::Failed)
    {
        return Err(batch_error(&responses));
    }

    Ok(Json(responses))
}

async fn file_deploy(
    Extension(service): Extension<OtaService>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileDeployResponse>>> {
    let form = read_upload_form(&mut multipart).await?;
    if form.files.len() != form.info.file_list.len() {
        return Err(Error::Validation(
            "number of files and file info do not match".to_string(),
        ));
    }

    let timestamp = Utc::now();
    let mut responses = Vec::with_capacity(form.files.len());

    for ((file_name, data), info) in form.files.into_iter().zip(form.info.file_list) {
        let upload = service.upload_file(file_name, data, info, timestamp).await;
        let mut response = FileDeployResponse::from(upload);

        if response.state == TaskState::Uploaded {
            deploy_uploaded(&service, &mut response).await;
        }

        responses.push(response);
    }

    if responses
        .iter()
        .any(|response| response.state == TaskState::Failed)
    {
        return Err(batch_error(&responses));
    }

    Ok(Json(responses))
}

/// Turns one successfully uploaded entry into a deploy job, or marks it
/// failed when the required routing information is missing.
async fn deploy_uploaded(service: &OtaService, response: &mut FileDeployResponse) {
    let Some(robot_id) = response.robot_id.clone().filter(|id| !id.is_empty()) else {
        response.state = TaskState::Failed;
        response.error_msg = Some("robot_id is required".to_string());
        return;
    };
    let Some(deploy_path) = response.deploy_path.clone().filter(|path| !path.is_empty()) else {
        response.state = TaskState::Failed;
        response.error_msg = Some("deploy_path is required".to_string());
        return;
    };
    let Some(object_name) = response.object_name.clone() else {
        response.state = TaskState::Failed;
        response.error_msg = Some("object_name is required".to_string());
        return;
    };

    match service
        .deploy_file(&response.bucket, &object_name, &robot_id, &deploy_path)
        .await
    {
        Ok(job_id) => {
            response.state = TaskState::Pending;
            response.job_id = Some(job_id);
        }
        Err(error) => {
            response.state = TaskState::Failed;
            response.error_msg = Some(error.to_string());
        }
    }
}

async fn file_update(
    Extension(service): Extension<OtaService>,
    mut multipart: Multipart,
) -> Result<Json<FileUploadResponse>> {
    let mut info: Option<FileUpdate> = None;
    let mut file: Option<(Option<String>, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| Error::Validation(error.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file_info") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|error| Error::Validation(error.to_string()))?;
                info = Some(
                    serde_json::from_str(&raw)
                        .map_err(|error| Error::Validation(format!("invalid file_info: {error}")))?,
                );
            }
            Some("file") => {
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|error| Error::Validation(error.to_string()))?;
                file = Some((file_name, data));
            }
            _ => {}
        }
    }

    let info = info.ok_or_else(|| Error::Validation("missing file_info field".to_string()))?;

    if service
        .persistence()
        .get_artifact(&info.bucket, &info.object_name)
        .await?
        .is_none()
    {
        return Err(Error::Validation("the file does not exist".to_string()));
    }

    let (file_name, data) = match file {
        Some((file_name, data)) => (file_name, Some(data)),
        None => (None, None),
    };

    let response = service
        .update_file(file_name, data, info, Utc::now())
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct DeployFromS3Params {
    robot_id: String,
    bucket: String,
    object_name: String,
    deploy_path: Option<String>,
}

async fn file_deploy_from_s3(
    Extension(service): Extension<OtaService>,
    Query(params): Query<DeployFromS3Params>,
) -> Result<Json<FileDeployResponse>> {
    let artifact = service
        .persistence()
        .get_artifact(&params.bucket, &params.object_name)
        .await?
        .ok_or_else(|| Error::NotFound("File not found".to_string()))?;

    // The override applies to this job only; the artifact row keeps its
    // recorded deploy path.
    let deploy_path = params
        .deploy_path
        .or_else(|| artifact.deploy_path.clone())
        .filter(|path| !path.is_empty())
        .ok_or_else(|| Error::NotFound("parameter deploy_path is required".to_string()))?;

    let job_id = service
        .deploy_file(
            &artifact.bucket,
            &artifact.object_name,
            &params.robot_id,
            &deploy_path,
        )
        .await?;

    Ok(Json(FileDeployResponse {
        bucket: artifact.bucket,
        object_name: Some(artifact.object_name),
        robot_id: Some(params.robot_id),
        deploy_path: Some(deploy_path),
        filename: artifact.file_name,
        state: TaskState::Pending,
        error_msg: None,
        job_id: Some(job_id),
    }))
}

#[derive(Debug, Deserialize)]
struct ObjectParams {
    #[serde(default = "default_bucket")]
    bucket: String,
    object_name: String,
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

async fn file_download(
    Extension(service): Extension<OtaService>,
    Query(params): Query<ObjectParams>,
) -> Result<Response> {
    let artifact = service
        .persistence()
        .get_artifact(&params.bucket, &params.object_name)
        .await?
        .ok_or_else(|| Error::NotFound("File not found".to_string()))?;

    let data = service.download(&params.bucket, &params.object_name).await?;

    let file_name = artifact
        .file_name
        .unwrap_or_else(|| params.object_name.clone());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

async fn file_validate(
    Extension(service): Extension<OtaService>,
    Query(params): Query<ObjectParams>,
) -> Result<Json<Artifact>> {
    set_valid(&service, &params, true).await
}

async fn file_invalidate(
    Extension(service): Extension<OtaService>,
    Query(params): Query<ObjectParams>,
) -> Result<Json<Artifact>> {
    set_valid(&service, &params, false).await
}

async fn set_valid(
    service: &OtaService,
    params: &ObjectParams,
    valid: bool,
) -> Result<Json<Artifact>> {
    let persistence = service.persistence();

    persistence
        .get_artifact(&params.bucket, &params.object_name)
        .await?
        .ok_or_else(|| Error::NotFound("File not found".to_string()))?;

    persistence
        .update_artifact(
            &params.bucket,
            &params.object_name,
            &crate::persistence::ArtifactUpdate {
                valid: Some(valid),
                ..Default::default()
            },
            Utc::now(),
        )
        .await?;

    let updated = persistence
        .get_artifact(&params.bucket, &params.object_name)
        .await?
        .ok_or_else(|| Error::NotFound("File not found".to_string()))?;

    Ok(Json(updated))
}

async fn file_delete(
    Extension(service): Extension<OtaService>,
    Query(params): Query<ObjectParams>,
) -> Result<StatusCode> {
    service
        .persistence()
        .get_artifact(&params.bucket, &params.object_name)
        .await?
        .ok_or_else(|| Error::NotFound("File not found".to_string()))?;

    service
        .delete_file(&params.bucket, &params.object_name)
        .await?;

    Ok(StatusCode::OK)
}

async fn deploy_state(
    Extension(persistence): Extension<Persistence>,
    Path(robot_id): Path<String>,
) -> Result<Json<Vec<DeployTarget>>> {
    let targets = persistence.get_deploy_targets(&robot_id).await?;
    Ok(Json(targets))
}

async fn job_state(
    Extension(persistence): Extension<Persistence>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DeployJob>> {
    let job = persistence
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound("Job not found".to_string()))?;
    Ok(Json(job))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "OTA File Service: Running" }))
}
