use chrono::{DateTime, Utc};
use ota_common::deploy::JobStatus;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// One deploy job row. Rows outlive their terminal state for audit.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct DeployJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub robot_id: String,
    pub deploy_path: String,
    /// The exact payload published on the deploy topic, preserved verbatim
    /// so resends are byte-identical.
    pub deploy_msg: String,
    pub timestamp: DateTime<Utc>,
    pub error_msg: Option<String>,
}
