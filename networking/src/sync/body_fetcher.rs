/// Body range fetching.
///
/// Closes the gap between `header_tip` and `tip` by fetching block bodies in
/// ranges over headers already on file.
///
/// ## The Cycle
///
/// `Idle -> RangeComputed -> FetchIssued -> {BatchComplete | NoBlockFound | RolledBack} -> Idle`
///
/// Only the monitor task starts a cycle (through [`BodyRangeFetcher::tick`]).
/// The session callback context only consumes results, so fetch issuance is
/// never re-entered from a callback.
///
/// ## Continuity
///
/// A body is stored only if it extends `tip` by exactly one block, or if it
/// is a Byron epoch boundary block sharing the tip's block number at a
/// higher slot. Everything else is discarded as stale. A run of
/// [`STALE_RECOVERY_THRESHOLD`] stale bodies usually means a broken on-disk
/// index, so it triggers a single background corruption probe.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use chain::{ChainStore, StoreError};
use containers::{Block, ChainTip, Header, Point};
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::config::{STALE_RECOVERY_THRESHOLD, SyncConfig};
use super::peer::PeerChannel;
use super::states::{PhaseCell, SyncPhase};

/// Pause requested through [`BodyRangeFetcher::pause`].
const PAUSED_EXTERNAL: u8 = 0b01;
/// Pause held by a running corruption probe.
const PAUSED_RECOVERY: u8 = 0b10;
/// Pause held while a rollback rewinds the store.
const PAUSED_ROLLBACK: u8 = 0b100;

/// The one in-flight range fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub id: u64,
    pub from: Point,
    pub to: Point,
    pub size: u32,
    pub issued_at: Instant,
}

/// Target of the most recent rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackMarker {
    pub point: Point,
}

/// Result of one monitor cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Stopped,
    Paused,
    InFlight,
    BelowThreshold { gap: u64 },
    NoNextHeader,
    StoreUnavailable,
    IssueFailed,
    Issued(BatchDescriptor),
}

/// Why a delivered body was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Nothing stored yet and the body is neither an EBB nor block #1.
    UnexpectedFirstBlock { block_number: u64 },
    /// Does not extend the current tip.
    NotSuccessor {
        tip_block_number: u64,
        block_number: u64,
    },
    /// The previous block's body is not on file.
    MissingPredecessor { block_number: u64 },
}

/// Result of ingesting one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Stored(ChainTip),
    Stale(StaleReason),
    Malformed,
    StoreFailed,
    /// Delivered after the fetcher was stopped.
    Ignored,
}

pub struct BodyRangeFetcher<S: ChainStore, P: PeerChannel> {
    store: Arc<S>,
    peer: Arc<P>,
    config: SyncConfig,
    phase: Arc<PhaseCell>,
    metrics: SharedMetrics,

    stopped: AtomicBool,
    pause_flags: AtomicU8,

    /// Single-flight latch for range fetches. Only changed while `batch`
    /// is locked, so it is set exactly when a descriptor is installed.
    batch_in_flight: AtomicBool,
    batch: Mutex<Option<BatchDescriptor>>,
    next_batch_id: AtomicU64,

    stale_count: AtomicU32,
    /// Single-flight latch for corruption probes.
    recovery_running: AtomicBool,
    probes_started: AtomicU64,
    fatal: Mutex<Option<String>>,

    bodies_received: AtomicU64,
    stale_total: AtomicU64,
    batches_completed: AtomicU64,
    last_body: Mutex<Option<ChainTip>>,
    rollback_marker: Mutex<Option<RollbackMarker>>,
}

impl<S, P> BodyRangeFetcher<S, P>
where
    S: ChainStore + 'static,
    P: PeerChannel + 'static,
{
    pub fn new(
        store: Arc<S>,
        peer: Arc<P>,
        config: SyncConfig,
        phase: Arc<PhaseCell>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            peer,
            config,
            phase,
            metrics,
            stopped: AtomicBool::new(false),
            pause_flags: AtomicU8::new(0),
            batch_in_flight: AtomicBool::new(false),
            batch: Mutex::new(None),
            next_batch_id: AtomicU64::new(0),
            stale_count: AtomicU32::new(0),
            recovery_running: AtomicBool::new(false),
            probes_started: AtomicU64::new(0),
            fatal: Mutex::new(None),
            bodies_received: AtomicU64::new(0),
            stale_total: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            last_body: Mutex::new(None),
            rollback_marker: Mutex::new(None),
        }
    }

    pub fn pause(&self) {
        self.pause_flags.fetch_or(PAUSED_EXTERNAL, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        self.pause_flags.fetch_and(!PAUSED_EXTERNAL, Ordering::AcqRel);
    }

    pub(crate) fn pause_for_rollback(&self) {
        self.pause_flags.fetch_or(PAUSED_ROLLBACK, Ordering::AcqRel);
    }

    pub(crate) fn end_rollback_pause(&self) {
        self.pause_flags.fetch_and(!PAUSED_ROLLBACK, Ordering::AcqRel);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_flags.load(Ordering::Acquire) != 0
    }

    /// Stop issuing fetches. In-flight batches are abandoned and later
    /// callbacks become no-ops.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.clear_batch();
            info!("Body fetcher stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Slots between `header_tip` and `tip`.
    pub fn gap(&self) -> Result<u64, StoreError> {
        let Some(header_tip) = self.store.header_tip()? else {
            return Ok(0);
        };
        Ok(match self.store.tip()? {
            Some(tip) => header_tip.slot.saturating_sub(tip.slot),
            None => header_tip.slot,
        })
    }

    fn fetch_threshold(&self) -> u64 {
        if self.phase.is(SyncPhase::SteadyState) {
            1
        } else {
            self.config.gap_threshold.max(1)
        }
    }

    /// One monitor cycle: decide whether the gap warrants a fetch and, if so,
    /// issue exactly one.
    pub async fn tick(&self) -> TickOutcome {
        if self.is_stopped() {
            return TickOutcome::Stopped;
        }
        if self.is_paused() {
            return TickOutcome::Paused;
        }
        if self.batch_in_flight.load(Ordering::Acquire) {
            return TickOutcome::InFlight;
        }

        let gap = match self.gap() {
            Ok(gap) => gap,
            Err(err) => {
                warn!(%err, "Could not read chain tips");
                return TickOutcome::StoreUnavailable;
            }
        };
        self.metrics.set_gap(gap);

        if gap < self.fetch_threshold() {
            return TickOutcome::BelowThreshold { gap };
        }

        let batch = {
            let mut current = self.batch.lock();
            if self
                .batch_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return TickOutcome::InFlight;
            }

            let batch = match self.compute_range() {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    self.batch_in_flight.store(false, Ordering::Release);
                    return TickOutcome::NoNextHeader;
                }
                Err(err) => {
                    self.batch_in_flight.store(false, Ordering::Release);
                    warn!(%err, "Could not compute fetch range");
                    return TickOutcome::StoreUnavailable;
                }
            };

            // A stop or rollback may have landed while the range was computed.
            if self.is_stopped() || self.is_paused() {
                self.batch_in_flight.store(false, Ordering::Release);
                return if self.is_stopped() {
                    TickOutcome::Stopped
                } else {
                    TickOutcome::Paused
                };
            }

            *current = Some(batch.clone());
            batch
        };
        self.metrics.inc_batches_issued();

        debug!(
            from_slot = batch.from.slot,
            to_slot = batch.to.slot,
            size = batch.size,
            gap,
            "Issuing range fetch"
        );

        match self.peer.fetch_range(batch.from, batch.to).await {
            Ok(()) => TickOutcome::Issued(batch),
            Err(err) => {
                self.abandon_batch(batch.id);
                self.metrics.inc_batch_fetch_failures();
                warn!(
                    from_slot = batch.from.slot,
                    to_slot = batch.to.slot,
                    %err,
                    "Range fetch failed to issue, retrying next tick"
                );
                TickOutcome::IssueFailed
            }
        }
    }

    /// Range starting right after `tip` (or at the first header on file) and
    /// spanning at most `max_batch_size` headers.
    fn compute_range(&self) -> Result<Option<BatchDescriptor>, StoreError> {
        let from = match self.store.tip()? {
            Some(tip) => self.store.find_next_block_header(&tip.point())?,
            None => self.store.first_block()?,
        };
        let Some(from) = from else {
            return Ok(None);
        };

        let (to, size) = match self
            .store
            .find_last_point_after_n_blocks(&from, self.config.max_batch_size)?
        {
            Some(end) => (end.point, end.blocks),
            None => (from, 1),
        };

        Ok(Some(BatchDescriptor {
            id: self.next_batch_id.fetch_add(1, Ordering::Relaxed),
            from,
            to,
            size,
            issued_at: Instant::now(),
        }))
    }

    fn clear_batch(&self) -> Option<BatchDescriptor> {
        let mut current = self.batch.lock();
        let batch = current.take();
        if batch.is_some() {
            self.batch_in_flight.store(false, Ordering::Release);
        }
        batch
    }

    /// Clear the in-flight batch only if it is still batch `id`.
    fn abandon_batch(&self, id: u64) {
        let mut current = self.batch.lock();
        if current.as_ref().is_some_and(|batch| batch.id == id) {
            *current = None;
            self.batch_in_flight.store(false, Ordering::Release);
        }
    }

    /// Validate and store one delivered body.
    pub fn on_block(self: &Arc<Self>, block: &Block) -> BlockOutcome {
        if self.is_stopped() {
            return BlockOutcome::Ignored;
        }
        if block.bytes.is_empty() {
            warn!(
                block_number = block.block_number(),
                "Dropping block with empty payload"
            );
            return BlockOutcome::Malformed;
        }

        let slot = block.header.absolute_slot(&self.config.slots);
        let block_number = block.block_number();
        let hash = block.hash();

        match self.check_continuity(&block.header, slot) {
            Ok(None) => {}
            Ok(Some(reason)) => {
                self.record_stale(slot, reason);
                return BlockOutcome::Stale(reason);
            }
            Err(err) => {
                error!(slot, block_number, %err, "Continuity check failed");
                return BlockOutcome::StoreFailed;
            }
        }

        if let Err(err) = self.store.store_block(hash, block_number, slot, &block.bytes) {
            error!(slot, block_number, %err, "Failed to store block");
            return BlockOutcome::StoreFailed;
        }

        self.stale_count.store(0, Ordering::Release);
        let tip = ChainTip::new(slot, block_number, hash);
        *self.last_body.lock() = Some(tip);
        let total = self.bodies_received.fetch_add(1, Ordering::Relaxed) + 1;

        self.metrics.inc_bodies_received();
        self.metrics.set_tip(slot, block_number);
        if let Ok(gap) = self.gap() {
            self.metrics.set_gap(gap);
        }

        if self.phase.is(SyncPhase::SteadyState) {
            info!(slot, block_number, era = %block.era(), "Stored block");
        } else if total % self.config.log_every_n.max(1) == 0 {
            info!(
                slot,
                block_number,
                bodies_received = total,
                "Body sync progress"
            );
        } else {
            debug!(slot, block_number, "Stored block");
        }

        BlockOutcome::Stored(tip)
    }

    fn check_continuity(&self, header: &Header, slot: u64) -> Result<Option<StaleReason>, StoreError> {
        let block_number = header.block_number();

        match self.store.tip()? {
            None => {
                if !header.is_ebb() && block_number != 1 {
                    return Ok(Some(StaleReason::UnexpectedFirstBlock { block_number }));
                }
            }
            Some(tip) => {
                let successor = block_number == tip.block_number + 1;
                // EBBs share the block number of the main block before them.
                let boundary = header.is_ebb()
                    && block_number == tip.block_number
                    && slot > tip.slot
                    && self.store.block_header(&header.hash())?.is_some();
                if !successor && !boundary {
                    return Ok(Some(StaleReason::NotSuccessor {
                        tip_block_number: tip.block_number,
                        block_number,
                    }));
                }
            }
        }

        if block_number > 1 && self.store.block_by_number(block_number - 1)?.is_none() {
            return Ok(Some(StaleReason::MissingPredecessor { block_number }));
        }

        Ok(None)
    }

    fn record_stale(self: &Arc<Self>, slot: u64, reason: StaleReason) {
        let count = self.stale_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.stale_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_stale_blocks();

        debug!(slot, ?reason, consecutive = count, "Discarding stale block");

        if count >= STALE_RECOVERY_THRESHOLD {
            self.trigger_recovery();
        }
    }

    /// Start a corruption probe unless one is already running.
    fn trigger_recovery(self: &Arc<Self>) -> bool {
        if self
            .recovery_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.probes_started.fetch_add(1, Ordering::Relaxed);
        warn!(
            consecutive = self.stale_count.load(Ordering::Acquire),
            "Too many stale blocks, probing chain store for corruption"
        );

        let fetcher = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || fetcher.run_recovery());
            }
            Err(_) => fetcher.run_recovery(),
        }
        true
    }

    fn run_recovery(&self) {
        self.pause_flags.fetch_or(PAUSED_RECOVERY, Ordering::AcqRel);

        let result = match self.store.detect_corruption() {
            Ok(true) => {
                warn!("Chain store corruption detected, recovering");
                match self.store.recover_from_corruption() {
                    Ok(()) => {
                        info!(tip = ?self.store.tip().ok().flatten(), "Chain store recovered");
                        self.metrics.inc_corruption_probes("recovered");
                        true
                    }
                    Err(err) => {
                        error!(%err, "Chain store recovery failed");
                        self.metrics.inc_corruption_probes("failed");
                        *self.fatal.lock() = Some(err.to_string());
                        false
                    }
                }
            }
            Ok(false) => {
                info!("Corruption probe found no inconsistencies");
                self.metrics.inc_corruption_probes("clean");
                true
            }
            Err(err) => {
                error!(%err, "Corruption probe failed");
                self.metrics.inc_corruption_probes("error");
                true
            }
        };

        self.stale_count.store(0, Ordering::Release);
        // An unrepaired store stays paused until the service shuts down.
        if result {
            self.pause_flags.fetch_and(!PAUSED_RECOVERY, Ordering::AcqRel);
        }
        self.recovery_running.store(false, Ordering::Release);
    }

    pub fn on_batch_started(&self) {
        if self.is_stopped() {
            return;
        }
        if let Some(batch) = self.batch.lock().as_ref() {
            debug!(
                from_slot = batch.from.slot,
                to_slot = batch.to.slot,
                "Batch started"
            );
        }
    }

    pub fn on_batch_done(&self) {
        if self.is_stopped() {
            return;
        }
        let batch = self.clear_batch();
        let completed = self.batches_completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.inc_batches_completed();

        if let Some(batch) = batch {
            let elapsed = batch.issued_at.elapsed();
            self.metrics.observe_batch_duration(elapsed.as_secs_f64());
            debug!(
                from_slot = batch.from.slot,
                to_slot = batch.to.slot,
                size = batch.size,
                elapsed_ms = elapsed.as_millis() as u64,
                batches_completed = completed,
                "Batch done"
            );
        }
    }

    /// The peer had nothing for the requested range. Retried on a later tick.
    pub fn on_no_block_found(&self, from: &Point, to: &Point) {
        if self.is_stopped() {
            return;
        }
        self.clear_batch();
        self.metrics.inc_no_block_found();
        warn!(from_slot = from.slot, to_slot = to.slot, "Peer returned no blocks for range");
    }

    /// Record the rollback target and abandon the in-flight batch.
    pub fn on_rollback(&self, point: Point) {
        *self.rollback_marker.lock() = Some(RollbackMarker { point });
        if let Some(batch) = self.clear_batch() {
            debug!(
                from_slot = batch.from.slot,
                to_slot = batch.to.slot,
                rollback_slot = point.slot,
                "Abandoned batch on rollback"
            );
        }
    }

    pub fn on_disconnect(&self) {
        if self.clear_batch().is_some() {
            debug!("Abandoned in-flight batch on disconnect");
        }
    }

    pub fn in_flight_batch(&self) -> Option<BatchDescriptor> {
        self.batch.lock().clone()
    }

    pub fn stale_count(&self) -> u32 {
        self.stale_count.load(Ordering::Acquire)
    }

    pub fn stale_total(&self) -> u64 {
        self.stale_total.load(Ordering::Relaxed)
    }

    pub fn recovery_in_progress(&self) -> bool {
        self.recovery_running.load(Ordering::Acquire)
    }

    pub fn probes_started(&self) -> u64 {
        self.probes_started.load(Ordering::Relaxed)
    }

    /// Set once a probe found corruption it could not repair.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn bodies_received(&self) -> u64 {
        self.bodies_received.load(Ordering::Relaxed)
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Relaxed)
    }

    pub fn last_body(&self) -> Option<ChainTip> {
        *self.last_body.lock()
    }

    pub fn rollback_marker(&self) -> Option<RollbackMarker> {
        *self.rollback_marker.lock()
    }
}
