use serde::Serialize;
use sqlx::FromRow;

/// Authoritative record of "this artifact is installed at this path on this
/// robot". Written only when a job completion is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct DeployTarget {
    pub robot_id: String,
    pub deploy_path: String,
    pub bucket: String,
    pub object_name: String,
}
