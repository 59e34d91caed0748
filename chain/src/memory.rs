//! In-memory chain store.
//!
//! Reference implementation of [`ChainStore`] used for embedding and tests.
//! Headers and blocks are ordered by `(slot, block_number)`: a Byron epoch
//! boundary block and the first main block of the epoch share a slot, and
//! the boundary block's lower block number puts it first.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included, Unbounded};

use containers::{ChainTip, Hash32, Point};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{ChainStore, RangeEnd, StoreError};

type ChainKey = (u64, u64);

#[derive(Debug, Clone)]
struct Record {
    hash: Hash32,
    block_number: u64,
    slot: u64,
    bytes: Vec<u8>,
}

impl Record {
    fn tip(&self) -> ChainTip {
        ChainTip::new(self.slot, self.block_number, self.hash)
    }

    fn point(&self) -> Point {
        Point::new(self.slot, self.hash)
    }
}

#[derive(Debug, Default)]
struct Inner {
    headers: BTreeMap<ChainKey, Record>,
    header_keys: HashMap<Hash32, ChainKey>,
    blocks: HashMap<Hash32, Record>,
    blocks_by_number: BTreeMap<u64, Hash32>,
    blocks_by_slot: BTreeMap<ChainKey, Hash32>,
    header_tip: Option<ChainTip>,
    tip: Option<ChainTip>,
}

impl Inner {
    /// Index problems, one line each.
    fn inconsistencies(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (number, hash) in &self.blocks_by_number {
            match self.blocks.get(hash) {
                None => problems.push(format!("block #{number} indexed but body {hash} missing")),
                Some(record) if record.block_number != *number => problems.push(format!(
                    "block #{number} index points at block #{}",
                    record.block_number
                )),
                Some(_) => {}
            }
        }

        for (key, hash) in &self.blocks_by_slot {
            if !self.blocks.contains_key(hash) {
                problems.push(format!("slot {} indexed but body {hash} missing", key.0));
            }
        }

        for record in self.blocks.values() {
            if !self.blocks_by_number.contains_key(&record.block_number) {
                problems.push(format!("block #{} has no number index", record.block_number));
            }
        }

        if let Some(tip) = &self.tip {
            if !self.blocks.contains_key(&tip.block_hash) {
                problems.push(format!("tip {} has no stored body", tip.block_hash));
            }
        }

        problems
    }

    fn last_block_tip(&self) -> Option<ChainTip> {
        self.blocks_by_slot
            .values()
            .next_back()
            .and_then(|hash| self.blocks.get(hash))
            .map(Record::tip)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    inner: RwLock<Inner>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_count(&self) -> usize {
        self.inner.read().headers.len()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn has_block(&self, hash: &Hash32) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    /// Removes the stored body for `block_number` while leaving its index
    /// entries in place, reproducing a torn write. Used to exercise
    /// corruption detection and recovery.
    pub fn inject_missing_body(&self, block_number: u64) -> bool {
        let mut inner = self.inner.write();
        match inner.blocks_by_number.get(&block_number).copied() {
            Some(hash) => inner.blocks.remove(&hash).is_some(),
            None => false,
        }
    }
}

impl ChainStore for InMemoryChainStore {
    fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        Ok(self.inner.read().tip)
    }

    fn header_tip(&self) -> Result<Option<ChainTip>, StoreError> {
        Ok(self.inner.read().header_tip)
    }

    fn store_block(
        &self,
        hash: Hash32,
        block_number: u64,
        slot: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = Record {
            hash,
            block_number,
            slot,
            bytes: bytes.to_vec(),
        };
        let tip = record.tip();

        inner.blocks_by_number.insert(block_number, hash);
        inner.blocks_by_slot.insert((slot, block_number), hash);
        inner.blocks.insert(hash, record);
        inner.tip = Some(tip);

        if inner.header_tip.map_or(true, |header_tip| header_tip.slot < slot) {
            inner.header_tip = Some(tip);
        }

        Ok(())
    }

    fn store_block_header(
        &self,
        hash: Hash32,
        block_number: u64,
        slot: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let key = (slot, block_number);
        let record = Record {
            hash,
            block_number,
            slot,
            bytes: bytes.to_vec(),
        };
        let tip = record.tip();

        inner.headers.insert(key, record);
        inner.header_keys.insert(hash, key);
        inner.header_tip = Some(tip);

        Ok(())
    }

    fn block_by_number(&self, block_number: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .blocks_by_number
            .get(&block_number)
            .and_then(|hash| inner.blocks.get(hash))
            .map(|record| record.bytes.clone()))
    }

    fn block_header(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .header_keys
            .get(hash)
            .and_then(|key| inner.headers.get(key))
            .map(|record| record.bytes.clone()))
    }

    fn first_block(&self) -> Result<Option<Point>, StoreError> {
        Ok(self
            .inner
            .read()
            .headers
            .values()
            .next()
            .map(Record::point))
    }

    fn find_next_block_header(&self, after: &Point) -> Result<Option<Point>, StoreError> {
        let inner = self.inner.read();
        let lower = match inner.header_keys.get(&after.hash) {
            Some(key) => Excluded(*key),
            // Unknown hash: continue from the slot alone.
            None => Excluded((after.slot, u64::MAX)),
        };

        Ok(inner
            .headers
            .range((lower, Unbounded))
            .next()
            .map(|(_, record)| record.point()))
    }

    fn find_last_point_after_n_blocks(
        &self,
        from: &Point,
        n: u32,
    ) -> Result<Option<RangeEnd>, StoreError> {
        let inner = self.inner.read();
        let Some(start) = inner.header_keys.get(&from.hash).copied() else {
            return Ok(None);
        };

        let mut end = None;
        let mut blocks = 0u32;
        for (_, record) in inner
            .headers
            .range((Included(start), Unbounded))
            .take(n.max(1) as usize)
        {
            blocks += 1;
            end = Some(record.point());
        }

        Ok(end.map(|point| RangeEnd { point, blocks }))
    }

    fn rollback_to(&self, slot: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Some(cut) = slot.checked_add(1) else {
            return Ok(());
        };

        let dropped_headers = inner.headers.split_off(&(cut, 0));
        for record in dropped_headers.values() {
            inner.header_keys.remove(&record.hash);
        }

        let dropped_blocks = inner.blocks_by_slot.split_off(&(cut, 0));
        for ((_, number), hash) in &dropped_blocks {
            inner.blocks.remove(hash);
            if inner.blocks_by_number.get(number) == Some(hash) {
                inner.blocks_by_number.remove(number);
                // A dropped EBB shares its number with the main block before it.
                let survivor = inner
                    .blocks_by_slot
                    .iter()
                    .rev()
                    .find(|((_, kept), _)| kept == number)
                    .map(|(_, kept_hash)| *kept_hash);
                if let Some(survivor) = survivor {
                    inner.blocks_by_number.insert(*number, survivor);
                }
            }
        }

        inner.header_tip = inner.headers.values().next_back().map(Record::tip);
        inner.tip = inner.last_block_tip();

        debug!(
            slot,
            dropped_headers = dropped_headers.len(),
            dropped_blocks = dropped_blocks.len(),
            "Rolled back chain store"
        );

        Ok(())
    }

    fn detect_corruption(&self) -> Result<bool, StoreError> {
        let problems = self.inner.read().inconsistencies();
        for problem in &problems {
            warn!(problem = %problem, "Chain store inconsistency");
        }
        Ok(!problems.is_empty())
    }

    fn recover_from_corruption(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        // Keep the longest contiguous prefix of stored bodies; everything after
        // the first hole is refetched.
        let mut ordered: Vec<Record> = inner.blocks.values().cloned().collect();
        ordered.sort_by_key(|record| (record.slot, record.block_number));

        let mut kept: Vec<Record> = Vec::with_capacity(ordered.len());
        for record in ordered {
            if let Some(prev) = kept.last() {
                let contiguous = record.block_number == prev.block_number
                    || record.block_number == prev.block_number + 1;
                if !contiguous {
                    break;
                }
            }
            kept.push(record);
        }

        // A hole before the lowest surviving body means the prefix itself is
        // unusable.
        let lowest_indexed = inner.blocks_by_number.keys().next().copied();
        if let (Some(lowest), Some(first)) = (lowest_indexed, kept.first()) {
            if lowest < first.block_number {
                kept.clear();
            }
        }

        let dropped = inner.blocks.len() - kept.len();
        inner.blocks.clear();
        inner.blocks_by_number.clear();
        inner.blocks_by_slot.clear();
        for record in kept {
            inner.blocks_by_number.insert(record.block_number, record.hash);
            inner
                .blocks_by_slot
                .insert((record.slot, record.block_number), record.hash);
            inner.blocks.insert(record.hash, record);
        }
        inner.tip = inner.last_block_tip();

        inner.header_keys = inner
            .headers
            .iter()
            .map(|(key, record)| (record.hash, *key))
            .collect();
        if let Some(tip) = inner.tip {
            if inner.header_tip.map_or(true, |header_tip| header_tip.slot < tip.slot) {
                inner.header_tip = Some(tip);
            }
        }

        let remaining = inner.inconsistencies();
        if !remaining.is_empty() {
            return Err(StoreError::RecoveryFailed(remaining.join("; ")));
        }

        info!(
            dropped_blocks = dropped,
            tip_slot = inner.tip.map(|tip| tip.slot),
            "Recovered chain store indexes"
        );

        Ok(())
    }
}
