use crate::{Era, Hash32, Point, SlotConfig};
use serde::{Deserialize, Serialize};

/// Structural category of a header, used for per-category counters and the
/// epoch boundary block continuity exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
    ByronMain,
    ByronEbb,
    Shelley,
}

/// A decoded block header.
///
/// Byron headers address their slot relative to an epoch; everything from
/// Shelley onwards carries an absolute slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Header {
    ByronMain {
        epoch: u64,
        slot_in_epoch: u64,
        block_number: u64,
        hash: Hash32,
    },
    /// Epoch boundary block. Shares its block number with the main block
    /// preceding it.
    ByronEbb {
        epoch: u64,
        block_number: u64,
        hash: Hash32,
    },
    Shelley {
        era: Era,
        slot: u64,
        block_number: u64,
        hash: Hash32,
    },
}

impl Header {
    pub fn era(&self) -> Era {
        match self {
            Header::ByronMain { .. } | Header::ByronEbb { .. } => Era::Byron,
            Header::Shelley { era, .. } => *era,
        }
    }

    pub fn kind(&self) -> HeaderKind {
        match self {
            Header::ByronMain { .. } => HeaderKind::ByronMain,
            Header::ByronEbb { .. } => HeaderKind::ByronEbb,
            Header::Shelley { .. } => HeaderKind::Shelley,
        }
    }

    pub fn is_ebb(&self) -> bool {
        matches!(self, Header::ByronEbb { .. })
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Header::ByronMain { block_number, .. }
            | Header::ByronEbb { block_number, .. }
            | Header::Shelley { block_number, .. } => *block_number,
        }
    }

    pub fn hash(&self) -> Hash32 {
        match self {
            Header::ByronMain { hash, .. }
            | Header::ByronEbb { hash, .. }
            | Header::Shelley { hash, .. } => *hash,
        }
    }

    pub fn absolute_slot(&self, slots: &SlotConfig) -> u64 {
        match self {
            Header::ByronMain {
                epoch,
                slot_in_epoch,
                ..
            } => slots.byron_absolute_slot(*epoch, *slot_in_epoch),
            Header::ByronEbb { epoch, .. } => slots.byron_ebb_slot(*epoch),
            Header::Shelley { slot, .. } => *slot,
        }
    }

    pub fn point(&self, slots: &SlotConfig) -> Point {
        Point::new(self.absolute_slot(slots), self.hash())
    }
}

/// A complete block as delivered by block-fetch: its decoded header plus the
/// raw serialized block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub bytes: Vec<u8>,
}

impl Block {
    pub fn new(header: Header, bytes: Vec<u8>) -> Self {
        Self { header, bytes }
    }

    pub fn era(&self) -> Era {
        self.header.era()
    }

    pub fn block_number(&self) -> u64 {
        self.header.block_number()
    }

    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }
}
