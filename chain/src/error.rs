use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("unknown point: {0}")]
    UnknownPoint(String),
    #[error("corrupted index: {0}")]
    Corrupted(String),
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}
