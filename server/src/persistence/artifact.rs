use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

/// One tracked file in object storage.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Artifact {
    pub bucket: String,
    pub object_name: String,
    pub file_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub robot_id: Option<String>,
    pub robot_type: Option<String>,
    pub robot_version: Option<String>,
    pub deploy_path: Option<String>,
    pub sha256: String,
    pub file_metadata: Json<BTreeMap<String, String>>,
    pub valid: bool,
}

/// Search criteria for listing artifacts. `None` means any; every entry of
/// `file_metadata` becomes an AND predicate over the stored document.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub bucket: Option<String>,
    pub object_name: Option<String>,
    pub robot_id: Option<String>,
    pub robot_type: Option<String>,
    pub deploy_path: Option<String>,
    pub file_metadata: BTreeMap<String, String>,
}

/// The identity uploads are deduplicated on: same content, same placement,
/// same metadata. `object_name` participates only when the caller named one.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub bucket: String,
    pub sha256: String,
    pub robot_id: Option<String>,
    pub deploy_path: Option<String>,
    pub robot_type: Option<String>,
    pub robot_version: Option<String>,
    pub file_metadata: BTreeMap<String, String>,
    pub object_name: Option<String>,
}

/// Partial row update; `None` fields are left untouched. The row timestamp
/// is always bumped.
#[derive(Debug, Clone, Default)]
pub struct ArtifactUpdate {
    pub robot_id: Option<String>,
    pub robot_type: Option<String>,
    pub robot_version: Option<String>,
    pub deploy_path: Option<String>,
    pub file_metadata: Option<BTreeMap<String, String>>,
    pub file_name: Option<String>,
    pub sha256: Option<String>,
    pub valid: Option<bool>,
}
