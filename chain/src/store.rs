//! Chain store contract consumed by the sync pipeline.
//!
//! The store keeps two independent tips: `header_tip`, the furthest header on
//! file, and `tip`, the furthest complete block. Writes are synchronous and
//! each one atomically advances its tip. If a body is stored beyond the
//! current `header_tip`, the store advances `header_tip` with it so that
//! `header_tip.slot >= tip.slot` always holds.

use containers::{ChainTip, Hash32, Point};

use crate::StoreError;

/// End of a header-index walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEnd {
    /// Last header reached by the walk.
    pub point: Point,
    /// Number of headers in `[from, point]`, inclusive.
    pub blocks: u32,
}

pub trait ChainStore: Send + Sync {
    /// Furthest complete block, if any.
    fn tip(&self) -> Result<Option<ChainTip>, StoreError>;

    /// Furthest stored header, if any.
    fn header_tip(&self) -> Result<Option<ChainTip>, StoreError>;

    fn store_block(
        &self,
        hash: Hash32,
        block_number: u64,
        slot: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    fn store_block_header(
        &self,
        hash: Hash32,
        block_number: u64,
        slot: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Raw block bytes stored under `block_number`.
    fn block_by_number(&self, block_number: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Raw header bytes stored under `hash`.
    fn block_header(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError>;

    /// Point of the earliest header on file.
    fn first_block(&self) -> Result<Option<Point>, StoreError>;

    /// Header immediately following `after` in chain order.
    fn find_next_block_header(&self, after: &Point) -> Result<Option<Point>, StoreError>;

    /// Walks forward at most `n` headers starting at (and including) `from`.
    ///
    /// The walk follows the header index, so empty slots are skipped.
    /// Returns `None` when `from` is not on file.
    fn find_last_point_after_n_blocks(
        &self,
        from: &Point,
        n: u32,
    ) -> Result<Option<RangeEnd>, StoreError>;

    /// Drops every header and block with a slot greater than `slot` and moves
    /// both tips back accordingly.
    fn rollback_to(&self, slot: u64) -> Result<(), StoreError>;

    /// Returns true when the on-disk indexes disagree with each other.
    fn detect_corruption(&self) -> Result<bool, StoreError>;

    fn recover_from_corruption(&self) -> Result<(), StoreError>;
}
