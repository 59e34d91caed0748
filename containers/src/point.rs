use crate::Hash32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the chain: a slot together with the hash of the block
/// occupying it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub slot: u64,
    pub hash: Hash32,
}

impl Point {
    pub fn new(slot: u64, hash: Hash32) -> Self {
        Self { slot, hash }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot, self.hash)
    }
}

/// Snapshot of the furthest stored header or body.
///
/// The store keeps two of these independently: `header_tip` for headers and
/// `tip` for complete blocks. Both are replaced wholesale rather than mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTip {
    pub slot: u64,
    pub block_number: u64,
    pub block_hash: Hash32,
}

impl ChainTip {
    pub fn new(slot: u64, block_number: u64, block_hash: Hash32) -> Self {
        Self {
            slot,
            block_number,
            block_hash,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.slot, self.block_hash)
    }
}
