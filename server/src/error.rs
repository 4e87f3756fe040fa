use ota_common::broker::BrokerError;
use ota_common::storage::StorageError;

use crate::persistence::PersistenceError;

/// A wrapper to capture any error possible with this service
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to interact with database: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("object store failure: {0}")]
    Storage(#[from] StorageError),
    #[error("broker failure: {0}")]
    Broker(#[from] BrokerError),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
