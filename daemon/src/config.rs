use std::env;
use std::fs;
use std::path::Path;

use ota_common::broker::{BrokerConfig, BrokerError};
use ota_common::storage::S3Config;
use serde::Deserialize;

fn default_robot_id() -> String {
    "robot_a".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_robot_id")]
    pub robot_id: String,
    #[serde(default)]
    pub cloud_service_url: String,
    pub s3: S3Config,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("robot_id is empty")]
    EmptyRobotId,
    #[error("cloud_service_url is empty")]
    EmptyCloudServiceUrl,
}

impl Config {
    /// Load from `path`, then let environment variables override the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;

        if let Ok(robot_id) = env::var("ROBOT_ID") {
            config.robot_id = robot_id;
        }
        if let Ok(cloud_service_url) = env::var("CLOUD_SERVICE_URL") {
            config.cloud_service_url = cloud_service_url;
        }
        config.s3.apply_env();
        config.broker.apply_env();

        if config.robot_id.is_empty() {
            return Err(ConfigError::EmptyRobotId);
        }
        if config.cloud_service_url.is_empty() {
            return Err(ConfigError::EmptyCloudServiceUrl);
        }
        config.broker.topic_pattern()?;

        Ok(config)
    }
}
