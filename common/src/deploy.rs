use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Payload published on the deploy topic when a job is created.
///
/// The serialized form is persisted verbatim on the job row so that later
/// resends are byte-identical to the original publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployMessage {
    pub job_id: Uuid,
    pub bucket: String,
    pub object_name: String,
    pub deploy_path: String,
}

/// Lifecycle of a deploy job.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job row created by the cloud, deploy message published
    Pending,

    /// The daemon has the job in its queue
    Received,

    /// The file is installed at its deploy path
    Completed,

    /// Download or install failed; the job will not be retried
    Failed,
}

impl JobStatus {
    /// Terminal states are acked by the cloud so the daemon can forget them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One entry of a daemon state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Everything a daemon currently knows, published on its state topic.
pub type StateSnapshot = HashMap<Uuid, JobState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_message_round_trips_through_json() {
        let message = DeployMessage {
            job_id: Uuid::new_v4(),
            bucket: "files".to_string(),
            object_name: "calibration.yaml_a1b2".to_string(),
            deploy_path: "/etc/robot/calibration.yaml".to_string(),
        };

        let raw = serde_json::to_string(&message).unwrap();
        assert_eq!(serde_json::from_str::<DeployMessage>(&raw).unwrap(), message);
    }

    #[test]
    fn job_status_uses_wire_casing() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"RECEIVED\"").unwrap(),
            JobStatus::Received
        );
        assert_eq!(JobStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Received.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn snapshot_omits_missing_error_messages() {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(
            Uuid::nil(),
            JobState {
                status: JobStatus::Received,
                error_msg: None,
            },
        );

        let raw = serde_json::to_string(&snapshot).unwrap();
        assert!(!raw.contains("error_msg"));
    }
}
