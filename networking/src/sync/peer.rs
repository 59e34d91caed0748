/// Seams between the sync core and its collaborators.
///
/// The chain-sync and block-fetch session layer sits on both sides: it
/// implements [`PeerChannel`] for outgoing requests and drives a
/// [`ChainSyncListener`] with protocol events. [`RelayNotifier`] is the
/// server-facing side that relays stored data downstream.
use anyhow::Result;
use containers::{Block, ChainTip, Header, Point};

use super::error::SyncError;

/// Network requester for block bodies.
///
/// Abstracts the block-fetch session to allow testing with mocks.
#[async_trait::async_trait]
pub trait PeerChannel: Send + Sync {
    /// Issue a range fetch for `[from, to]`.
    ///
    /// Returns once the request is on the wire; blocks arrive later through
    /// [`ChainSyncListener::on_block`] and the batch callbacks.
    async fn fetch_range(&self, from: Point, to: Point) -> Result<()>;

    /// Whether the underlying session is currently connected.
    fn is_running(&self) -> bool;

    /// Best tip the remote peer has advertised, if any.
    fn latest_tip(&self) -> Option<ChainTip>;
}

pub trait RelayNotifier: Send + Sync {
    /// A genuine chain reorganization rewound the local chain to `point`.
    fn notify_real_rollback(&self, point: Point);

    /// A new block body was stored while following the tip.
    fn notify_new_block_stored(&self);
}

/// Notifier for nodes that do not serve downstream peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl RelayNotifier for NoopNotifier {
    fn notify_real_rollback(&self, _point: Point) {}

    fn notify_new_block_stored(&self) {}
}

/// Protocol events delivered by the session layer, serially per connection.
pub trait ChainSyncListener: Send + Sync {
    fn on_header(&self, header: Header, raw_bytes: &[u8]);

    fn on_block(&self, block: Block);

    fn on_batch_started(&self);

    fn on_batch_done(&self);

    fn on_no_block_found(&self, from: Point, to: Point);

    /// Fails only for rollbacks that must not be executed or for store errors
    /// while rewinding.
    fn on_rollback(&self, point: Point) -> Result<(), SyncError>;

    fn on_intersection_found(&self, point: Point);

    fn on_intersection_not_found(&self);

    fn on_disconnect(&self);
}
