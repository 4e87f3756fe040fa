use std::fs;
use std::path::{Path, PathBuf};

use ota_common::broker::{BrokerConfig, BrokerError};
use ota_common::storage::S3Config;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ota-server.sqlite"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Config {
    /// Load from `path`, then let environment variables override the file.
    /// An invalid broker topic pattern is rejected here, before anything
    /// starts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;

        config.s3.apply_env();
        config.broker.apply_env();
        config.broker.topic_pattern()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let file = write_config(
            r#"
            [s3]
            endpoint_url = "http://localhost:9000"
            access_key_id = "minioadmin"
            secret_access_key = "minioadmin"
            "#,
        );

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.database.path, PathBuf::from("ota-server.sqlite"));
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.topic_pattern, "ota/<robot_id>/<operation>");
    }

    #[test]
    fn invalid_topic_pattern_is_rejected_at_load() {
        let file = write_config(
            r#"
            [s3]
            endpoint_url = "http://localhost:9000"
            access_key_id = "minioadmin"
            secret_access_key = "minioadmin"

            [broker]
            topic_pattern = "ota/robots/<operation>"
            "#,
        );

        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Broker(_))
        ));
    }
}
