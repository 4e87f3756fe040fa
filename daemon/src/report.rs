use std::time::Duration;

use ota_common::broker::Broker;
use tracing::{error, warn};

use crate::jobs::JobMap;

/// How often the daemon publishes its job map to the cloud.
pub const REPORT_STATE_PERIOD: Duration = Duration::from_millis(500);

/// Periodically publishes everything in the job map. The cloud treats each
/// snapshot as both a keep-alive and the robot's complete knowledge, so
/// even an empty map is worth sending.
pub async fn task(jobs: JobMap, broker: Broker, state_topic: String) {
    let mut interval = tokio::time::interval(REPORT_STATE_PERIOD);

    loop {
        interval.tick().await;

        let snapshot = jobs.snapshot();
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(error) => {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to serialize state snapshot"
                );
                continue;
            }
        };

        if let Err(error) = broker.publish(&state_topic, payload).await {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to publish state snapshot"
            );
        }
    }
}
