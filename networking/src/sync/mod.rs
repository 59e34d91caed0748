//! Chain synchronization for the relay node.
//!
//! Headers and bodies are synchronized as two independent streams against a
//! single ordered chain store:
//!
//! - **Header Stream Consumer**: Stores every header as it arrives and advances `header_tip`
//! - **Body Range Fetcher**: Watches the header/body gap and closes it with range fetches
//! - **Phase Coordinator**: Tracks the sync phase, classifies rollbacks, gates notifications
//! - **Sync Service**: Owns the components, implements the session callbacks, runs the monitor
//!
//! ## Flow
//!
//! 1. The chain-sync session delivers headers; they are stored immediately
//! 2. A timer-driven monitor reads the gap between `header_tip` and `tip`
//! 3. Once the gap crosses the phase threshold, one range fetch is issued
//! 4. Delivered bodies are checked for continuity against `tip` and stored
//! 5. Rollbacks pause the fetcher, rewind the store, and are classified as
//!    real reorganizations or reconnection artifacts
//!
//! ## State Machine
//!
//! - **INITIAL_SYNC**: Bulk catch-up, slow cadence, large batches
//! - **INTERSECT_PHASE**: Reconnected; expecting a replay rollback
//! - **STEADY_STATE**: Near the remote tip, fetch on every new header

pub mod body_fetcher;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod header_sync;
pub mod peer;
pub mod service;
pub mod states;

pub use body_fetcher::{BatchDescriptor, BlockOutcome, BodyRangeFetcher, RollbackMarker, StaleReason, TickOutcome};
pub use config::*;
pub use coordinator::{RollbackKind, SyncPhaseCoordinator, classify_rollback};
pub use error::SyncError;
pub use header_sync::{HeaderOutcome, HeaderStreamConsumer};
pub use peer::{ChainSyncListener, NoopNotifier, PeerChannel, RelayNotifier};
pub use service::{SyncService, SyncStatus};
pub use states::{PhaseCell, SyncPhase};

#[cfg(test)]
mod tests;
