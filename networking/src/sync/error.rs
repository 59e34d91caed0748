use chain::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("chain store error: {0}")]
    Store(#[from] StoreError),
    #[error(
        "refusing rollback to slot {target_slot} from a chain at block #{tip_block_number}"
    )]
    CatastrophicRollback {
        target_slot: u64,
        tip_block_number: u64,
    },
    #[error("chain store corruption could not be repaired: {0}")]
    UnrecoverableCorruption(String),
}
