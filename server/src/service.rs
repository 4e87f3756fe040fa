use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ota_common::broker::{Message, Publisher, TopicPattern};
use ota_common::deploy::{DeployMessage, JobStatus, StateSnapshot};
use ota_common::models::{FileCreate, FileUpdate, FileUploadResponse, TaskState};
use ota_common::storage::ObjectStore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::{ArtifactUpdate, Fingerprint, Persistence, PersistenceError};

/// Hash block size for streamed uploads.
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Everything the cloud side needs to serve requests and react to robot
/// state: the registry, the blob store and the broker publish seam.
/// Constructed once in `main` and injected into handlers and the broker
/// listener.
#[derive(Clone)]
pub struct OtaService {
    persistence: Persistence,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn Publisher>,
    topics: TopicPattern,
}

impl OtaService {
    pub fn new(
        persistence: Persistence,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn Publisher>,
        topics: TopicPattern,
    ) -> Self {
        Self {
            persistence,
            store,
            publisher,
            topics,
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Upload one file. Common logic for the upload and deploy endpoints;
    /// failures are reported in the per-file response, never as an error.
    ///
    /// Dedup order: primary-key collision check, content hash, fingerprint
    /// short-circuit (an idempotent re-upload returns the existing object
    /// name and writes nothing), then object upload and row insert.
    pub async fn upload_file(
        &self,
        file_name: Option<String>,
        data: Bytes,
        mut info: FileCreate,
        timestamp: DateTime<Utc>,
    ) -> FileUploadResponse {
        let user_object_name = info.object_name.clone();
        let object_name = user_object_name
            .clone()
            .unwrap_or_else(|| synthesize_object_name(file_name.as_deref()));
        info.object_name = Some(object_name.clone());

        let mut response = FileUploadResponse {
            bucket: info.bucket.clone(),
            object_name: Some(object_name.clone()),
            robot_id: info.robot_id.clone(),
            deploy_path: info.deploy_path.clone(),
            filename: file_name.clone(),
            state: TaskState::Uploaded,
            error_msg: None,
        };

        match self.persistence.get_artifact(&info.bucket, &object_name).await {
            Ok(Some(_)) => {
                response.state = TaskState::Failed;
                response.error_msg = Some(format!(
                    "object {} in bucket {} already exists",
                    object_name, info.bucket
                ));
                return response;
            }
            Ok(None) => {}
            Err(error) => return fail(response, error),
        }

        let sha256 = sha256_hex(&data);

        // A file with the same bytes and the same metadata is the same
        // artifact; answer with the name it is already stored under.
        let fingerprint = fingerprint_of(&info, &sha256, user_object_name);
        match self.persistence.find_fingerprint(&fingerprint).await {
            Ok(Some(existing)) => {
                response.object_name = Some(existing.object_name);
                return response;
            }
            Ok(None) => {}
            Err(error) => return fail(response, error),
        }

        if let Err(error) = self.store.upload(&info.bucket, &object_name, data).await {
            return fail(response, error);
        }

        if let Err(error) = self
            .persistence
            .create_artifact(&object_name, &info, file_name.as_deref(), &sha256, timestamp)
            .await
        {
            return fail(response, error);
        }

        response
    }

    /// Amend an existing artifact; the caller has already checked the row
    /// exists. A file body replaces the stored bytes unless the fingerprint
    /// says they are already there.
    pub async fn update_file(
        &self,
        file_name: Option<String>,
        data: Option<Bytes>,
        info: FileUpdate,
        timestamp: DateTime<Utc>,
    ) -> Result<FileUploadResponse> {
        let mut response = FileUploadResponse {
            bucket: info.bucket.clone(),
            object_name: Some(info.object_name.clone()),
            robot_id: info.robot_id.clone(),
            deploy_path: info.deploy_path.clone(),
            filename: file_name.clone(),
            state: TaskState::Uploaded,
            error_msg: None,
        };

        let mut update = ArtifactUpdate {
            robot_id: info.robot_id.clone(),
            robot_type: info.robot_type.clone(),
            robot_version: info.robot_version.clone(),
            deploy_path: info.deploy_path.clone(),
            file_metadata: info.file_metadata.clone(),
            file_name: None,
            sha256: None,
            valid: None,
        };

        if let Some(data) = data {
            let sha256 = sha256_hex(&data);

            let fingerprint = Fingerprint {
                bucket: info.bucket.clone(),
                sha256: sha256.clone(),
                robot_id: info.robot_id.clone(),
                deploy_path: info.deploy_path.clone(),
                robot_type: info.robot_type.clone(),
                robot_version: info.robot_version.clone(),
                file_metadata: info.file_metadata.clone().unwrap_or_default(),
                object_name: Some(info.object_name.clone()),
            };
            if let Some(existing) = self.persistence.find_fingerprint(&fingerprint).await? {
                response.object_name = Some(existing.object_name);
                return Ok(response);
            }

            self.store
                .upload(&info.bucket, &info.object_name, data)
                .await?;
            update.sha256 = Some(sha256);
            update.file_name = file_name;
        }

        self.persistence
            .update_artifact(&info.bucket, &info.object_name, &update, timestamp)
            .await?;

        Ok(response)
    }

    /// Create a deploy job for an uploaded artifact and publish it on the
    /// robot's deploy topic. The published payload is stored on the job row
    /// byte for byte so a resend repeats it exactly.
    pub async fn deploy_file(
        &self,
        bucket: &str,
        object_name: &str,
        robot_id: &str,
        deploy_path: &str,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let message = DeployMessage {
            job_id,
            bucket: bucket.to_string(),
            object_name: object_name.to_string(),
            deploy_path: deploy_path.to_string(),
        };
        let deploy_msg = serde_json::to_string(&message)?;

        self.persistence
            .create_job(job_id, robot_id, deploy_path, &deploy_msg)
            .await?;
        self.publisher
            .publish(&self.topics.deploy(robot_id), deploy_msg.into_bytes())
            .await?;

        info!(%job_id, robot_id, deploy_path, "deploy job published");

        Ok(job_id)
    }

    /// React to one state snapshot from a robot, in four ordered passes:
    /// resend jobs the daemon has forgotten, record reported statuses, ack
    /// terminal ones, and update the deployed view for completions.
    #[instrument(skip(self, payload))]
    pub async fn handle_state(&self, robot_id: &str, payload: &[u8]) -> Result<()> {
        let states: StateSnapshot = serde_json::from_slice(payload)?;

        // Anything we consider running that the daemon no longer lists was
        // lost somewhere along the way; publish the original message again.
        for job in self.persistence.get_running_jobs(robot_id).await? {
            if !states.contains_key(&job.job_id) {
                info!(job_id = %job.job_id, "resending deploy message");
                self.publisher
                    .publish(&self.topics.deploy(robot_id), job.deploy_msg.into_bytes())
                    .await?;
            }
        }

        for (job_id, state) in &states {
            match self
                .persistence
                .update_job_status(*job_id, state.status, state.error_msg.as_deref())
                .await
            {
                Ok(()) => {}
                Err(PersistenceError::UnknownJob(job_id)) => {
                    warn!(%job_id, "received state of unknown job");
                }
                Err(error) => return Err(error.into()),
            }
        }

        // Terminal states are acked so the daemon can forget them.
        for (job_id, state) in &states {
            if state.status.is_terminal() {
                self.publisher
                    .publish(&self.topics.ack(robot_id), job_id.to_string().into_bytes())
                    .await?;
            }
        }

        for (job_id, state) in &states {
            if state.status != JobStatus::Completed {
                continue;
            }
            let Some(job) = self.persistence.get_job(*job_id).await? else {
                continue;
            };
            let message: DeployMessage = serde_json::from_str(&job.deploy_msg)?;
            self.persistence
                .upsert_deploy_target(
                    &job.robot_id,
                    &job.deploy_path,
                    &message.bucket,
                    &message.object_name,
                )
                .await?;
        }

        Ok(())
    }

    pub async fn download(&self, bucket: &str, object_name: &str) -> Result<Bytes> {
        self.store
            .download(bucket, object_name)
            .await
            .map_err(Into::into)
    }

    /// Remove the registry row (cascading to deploy targets) and the stored
    /// object.
    pub async fn delete_file(&self, bucket: &str, object_name: &str) -> Result<()> {
        self.persistence.delete_artifact(bucket, object_name).await?;
        self.store.delete(bucket, object_name).await?;

        Ok(())
    }
}

/// Consumes state messages forwarded by the broker connection for the
/// lifetime of the service.
pub async fn state_listener(service: OtaService, mut messages: mpsc::Receiver<Message>) {
    while let Some(message) = messages.recv().await {
        let Some(robot_id) = service.topics.robot_id_from_state(&message.topic) else {
            warn!(topic = message.topic.as_str(), "got message from unrecognized topic");
            continue;
        };

        if let Err(error) = service.handle_state(&robot_id, &message.payload).await {
            error!(
                error = &error as &dyn std::error::Error,
                robot_id, "failed to process state message"
            );
        }
    }
}

fn synthesize_object_name(file_name: Option<&str>) -> String {
    match file_name {
        Some(file_name) => format!("{file_name}_{}", Uuid::new_v4()),
        None => Uuid::new_v4().to_string(),
    }
}

fn sha256_hex(data: &Bytes) -> String {
    let mut hasher = Sha256::new();
    for block in data.chunks(HASH_BLOCK_SIZE) {
        hasher.update(block);
    }
    hex::encode(hasher.finalize())
}

fn fingerprint_of(info: &FileCreate, sha256: &str, object_name: Option<String>) -> Fingerprint {
    Fingerprint {
        bucket: info.bucket.clone(),
        sha256: sha256.to_string(),
        robot_id: info.robot_id.clone(),
        deploy_path: info.deploy_path.clone(),
        robot_type: info.robot_type.clone(),
        robot_version: info.robot_version.clone(),
        file_metadata: info.file_metadata.clone(),
        object_name,
    }
}

fn fail(mut response: FileUploadResponse, error: impl std::error::Error) -> FileUploadResponse {
    response.state = TaskState::Failed;
    response.error_msg = Some(error.to_string());
    response
}
