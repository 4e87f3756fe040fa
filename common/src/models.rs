use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_BUCKET: &str = "files";

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

/// Metadata accompanying one uploaded file.
///
/// `file_metadata` is kept in a sorted map so the canonical JSON used for
/// dedup fingerprinting is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreate {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_version: Option<String>,
    #[serde(default)]
    pub file_metadata: BTreeMap<String, String>,
}

impl Default for FileCreate {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            object_name: None,
            robot_id: None,
            deploy_path: None,
            robot_type: None,
            robot_version: None,
            file_metadata: BTreeMap::new(),
        }
    }
}

/// The JSON field of the upload and deploy multipart forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCreateList {
    pub file_list: Vec<FileCreate>,
}

/// Attributes to amend on an existing artifact. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct FileUpdate {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub object_name: String,
    #[serde(default)]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub deploy_path: Option<String>,
    #[serde(default)]
    pub robot_type: Option<String>,
    #[serde(default)]
    pub robot_version: Option<String>,
    #[serde(default)]
    pub file_metadata: Option<BTreeMap<String, String>>,
}

/// Outcome of one file within a batch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Uploaded,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub bucket: String,
    pub object_name: Option<String>,
    pub robot_id: Option<String>,
    pub deploy_path: Option<String>,
    pub filename: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeployResponse {
    pub bucket: String,
    pub object_name: Option<String>,
    pub robot_id: Option<String>,
    pub deploy_path: Option<String>,
    pub filename: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl From<FileUploadResponse> for FileDeployResponse {
    fn from(upload: FileUploadResponse) -> Self {
        Self {
            bucket: upload.bucket,
            object_name: upload.object_name,
            robot_id: upload.robot_id,
            deploy_path: upload.deploy_path,
            filename: upload.filename,
            state: upload.state,
            error_msg: upload.error_msg,
            job_id: None,
        }
    }
}

/// A local file the daemon should push to the cloud service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub local_path: PathBuf,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub deploy_path: Option<String>,
    #[serde(default)]
    pub file_metadata: BTreeMap<String, String>,
}
