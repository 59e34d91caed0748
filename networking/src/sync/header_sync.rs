/// Header stream ingestion.
///
/// Stores every header delivered by the chain-sync session and advances
/// `header_tip`. The protocol delivers headers in strictly increasing
/// chain order, so no reordering happens here.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chain::ChainStore;
use containers::{ChainTip, Era, Header, HeaderKind, Point};
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::config::SyncConfig;
use super::states::{PhaseCell, SyncPhase};

/// Counter buckets: Byron main, Byron EBB, then one per post-Byron era.
const COUNTER_LABELS: [&str; 8] = [
    "byron",
    "byron_ebb",
    "shelley",
    "allegra",
    "mary",
    "alonzo",
    "babbage",
    "conway",
];

fn counter_index(header: &Header) -> usize {
    match header.kind() {
        HeaderKind::ByronMain => 0,
        HeaderKind::ByronEbb => 1,
        // Shelley has tag 1, Conway tag 6.
        HeaderKind::Shelley => (header.era().tag() as usize + 1).min(COUNTER_LABELS.len() - 1),
    }
}

/// Result of ingesting one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// Stored; `header_tip` is now this header.
    Stored(ChainTip),
    /// Empty payload, dropped without touching state.
    Malformed,
    /// The store rejected the write.
    StoreFailed,
}

pub struct HeaderStreamConsumer<S: ChainStore> {
    store: Arc<S>,
    config: SyncConfig,
    phase: Arc<PhaseCell>,
    metrics: SharedMetrics,

    headers_received: AtomicU64,
    per_era: [AtomicU64; 8],
    last_header: Mutex<Option<ChainTip>>,
}

impl<S: ChainStore> HeaderStreamConsumer<S> {
    pub fn new(
        store: Arc<S>,
        config: SyncConfig,
        phase: Arc<PhaseCell>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            config,
            phase,
            metrics,
            headers_received: AtomicU64::new(0),
            per_era: Default::default(),
            last_header: Mutex::new(None),
        }
    }

    /// Store a header delivered by the session.
    pub fn on_header(&self, header: &Header, raw_bytes: &[u8]) -> HeaderOutcome {
        if raw_bytes.is_empty() {
            warn!(era = %header.era(), "Dropping header with empty payload");
            return HeaderOutcome::Malformed;
        }

        let slot = header.absolute_slot(&self.config.slots);
        let block_number = header.block_number();
        let hash = header.hash();

        if let Err(err) = self
            .store
            .store_block_header(hash, block_number, slot, raw_bytes)
        {
            error!(slot, block_number, %err, "Failed to store header");
            return HeaderOutcome::StoreFailed;
        }

        let tip = ChainTip::new(slot, block_number, hash);
        *self.last_header.lock() = Some(tip);

        let total = self.headers_received.fetch_add(1, Ordering::Relaxed) + 1;
        let index = counter_index(header);
        self.per_era[index].fetch_add(1, Ordering::Relaxed);

        self.metrics.inc_headers_received(COUNTER_LABELS[index]);
        self.metrics.set_header_tip_slot(slot);

        debug!(slot, block_number, kind = ?header.kind(), "Stored header");
        if self.phase.is(SyncPhase::SteadyState) || total % self.config.log_every_n.max(1) == 0 {
            info!(
                slot,
                block_number,
                era = %header.era(),
                headers_received = total,
                "Header tip advanced"
            );
        }

        HeaderOutcome::Stored(tip)
    }

    /// Phase bookkeeping for intersections belongs to the coordinator.
    pub fn on_intersection_found(&self, point: &Point) {
        debug!(slot = point.slot, hash = %point.hash, "Header stream intersected");
    }

    /// The session layer owns the resume point across reconnections.
    pub fn on_disconnect(&self) {}

    pub fn headers_received(&self) -> u64 {
        self.headers_received.load(Ordering::Relaxed)
    }

    /// Headers stored for one counter bucket (`"byron"`, `"byron_ebb"`,
    /// `"shelley"`, ... `"conway"`).
    pub fn count_for(&self, label: &str) -> u64 {
        COUNTER_LABELS
            .iter()
            .position(|candidate| *candidate == label)
            .map_or(0, |index| self.per_era[index].load(Ordering::Relaxed))
    }

    pub fn era_count(&self, era: Era) -> u64 {
        match era {
            Era::Byron => self.count_for("byron") + self.count_for("byron_ebb"),
            other => self.count_for(other.name()),
        }
    }

    pub fn last_header(&self) -> Option<ChainTip> {
        *self.last_header.lock()
    }
}
