use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown job id {0}")]
    UnknownJob(Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;
