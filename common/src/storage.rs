use std::env;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Config, Region};
use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use bytes::Bytes;
use serde::Deserialize;

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Endpoint and credentials for any S3-compatible object store.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Config {
    /// Environment overrides, kept compatible with the deployment manifests.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint_url) = env::var("S3_ENDPOINT_URL") {
            self.endpoint_url = endpoint_url;
        }
        if let Ok(access_key_id) = env::var("S3_ID") {
            self.access_key_id = access_key_id;
        }
        if let Ok(secret_access_key) = env::var("S3_ACCESS_KEY") {
            self.secret_access_key = secret_access_key;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    S3(#[from] aws_sdk_s3::Error),
    #[error("failed to read object body: {0}")]
    Body(#[from] ByteStreamError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte-addressable blob store keyed by `(bucket, object_name)`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bucket: &str, object_name: &str, data: Bytes)
        -> Result<(), StorageError>;

    async fn download(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError>;

    async fn delete(&self, bucket: &str, object_name: &str) -> Result<(), StorageError>;
}

/// [`ObjectStore`] backed by the AWS SDK. Path-style addressing keeps it
/// working against MinIO.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(config: &S3Config) -> Self {
        let s3_config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint_url)
            .force_path_style(true)
            .credentials_provider(Credentials::from_keys(
                &config.access_key_id,
                &config.secret_access_key,
                None,
            ))
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        object_name: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(object_name)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;

        Ok(())
    }

    async fn download(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object_name)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;

        Ok(output.body.collect().await?.into_bytes())
    }

    async fn delete(&self, bucket: &str, object_name: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(object_name)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;

        Ok(())
    }
}
