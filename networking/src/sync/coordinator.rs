/// Sync phase coordination.
///
/// Owns the [`SyncPhase`] state machine and every decision that depends on
/// it: when to leave the intersect phase, whether a rollback is a real
/// reorganization, and whether downstream peers hear about new blocks.
///
/// ## Intersect Phase
///
/// Every reconnection starts with an intersection followed by a rollback to
/// that intersection. Rollbacks inside this window are never reported
/// downstream. The window ends when headers flow again or after the
/// intersect timeout, whichever comes first.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chain::ChainStore;
use containers::{ChainTip, Point};
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::body_fetcher::BodyRangeFetcher;
use super::config::SyncConfig;
use super::error::SyncError;
use super::peer::{PeerChannel, RelayNotifier};
use super::states::{PhaseCell, SyncPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    /// A genuine chain reorganization; reported downstream.
    Real,
    /// Replay caused by re-establishing the session; suppressed.
    ReconnectionArtifact,
}

impl RollbackKind {
    fn label(&self) -> &'static str {
        match self {
            RollbackKind::Real => "real",
            RollbackKind::ReconnectionArtifact => "reconnect",
        }
    }
}

/// Classify a rollback that has already been applied to the store.
///
/// Real only outside the intersect and initial-sync phases, when the target
/// lies strictly behind the tip observed before the rollback, and when the
/// store's tip afterwards is at or behind the target.
pub fn classify_rollback(
    phase: SyncPhase,
    target: &Point,
    tip_before: Option<ChainTip>,
    tip_after: Option<ChainTip>,
) -> RollbackKind {
    let transitional = matches!(phase, SyncPhase::IntersectPhase | SyncPhase::InitialSync);
    let behind_tip = tip_before.is_some_and(|tip| target.slot < tip.slot);
    let rewound = tip_after.map_or(true, |tip| tip.slot <= target.slot);

    if !transitional && behind_tip && rewound {
        RollbackKind::Real
    } else {
        RollbackKind::ReconnectionArtifact
    }
}

pub struct SyncPhaseCoordinator<S: ChainStore, P: PeerChannel, R: RelayNotifier> {
    store: Arc<S>,
    peer: Arc<P>,
    notifier: Arc<R>,
    fetcher: Arc<BodyRangeFetcher<S, P>>,
    phase: Arc<PhaseCell>,
    config: SyncConfig,
    metrics: SharedMetrics,

    intersect_entered_at: Mutex<Option<Instant>>,
    last_intersection: Mutex<Option<Point>>,
    real_rollbacks: AtomicU64,
    suppressed_rollbacks: AtomicU64,
}

impl<S, P, R> SyncPhaseCoordinator<S, P, R>
where
    S: ChainStore + 'static,
    P: PeerChannel + 'static,
    R: RelayNotifier,
{
    pub fn new(
        store: Arc<S>,
        peer: Arc<P>,
        notifier: Arc<R>,
        fetcher: Arc<BodyRangeFetcher<S, P>>,
        phase: Arc<PhaseCell>,
        config: SyncConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            peer,
            notifier,
            fetcher,
            phase,
            config,
            metrics,
            intersect_entered_at: Mutex::new(None),
            last_intersection: Mutex::new(None),
            real_rollbacks: AtomicU64::new(0),
            suppressed_rollbacks: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.load()
    }

    fn transition(&self, target: SyncPhase, reason: &'static str) -> bool {
        let current = self.phase.load();
        if current == target {
            return false;
        }
        if !current.can_transition_to(target) {
            warn!(from = ?current, to = ?target, reason, "Invalid phase transition attempted");
            return false;
        }
        if !self.phase.compare_and_set(current, target) {
            debug!(from = ?current, to = ?target, "Phase changed concurrently, skipping transition");
            return false;
        }

        self.metrics.set_phase(target.as_u8() as i64);
        info!(from = ?current, to = ?target, reason, "Sync phase changed");
        true
    }

    /// Slots between the local chain and the best remote tip.
    fn distance_to_remote_tip(&self) -> Option<u64> {
        let remote = self.peer.latest_tip()?;
        let local = match self.store.tip() {
            Ok(Some(tip)) => tip,
            Ok(None) => self.store.header_tip().ok().flatten()?,
            Err(err) => {
                warn!(%err, "Could not read local tip");
                return None;
            }
        };
        Some(remote.slot.saturating_sub(local.slot))
    }

    fn near_remote_tip(&self) -> bool {
        self.distance_to_remote_tip()
            .is_some_and(|distance| distance <= self.config.near_tip_slots)
    }

    /// Startup heuristic: skip bulk-sync cadence when the local chain is
    /// already close to the remote tip and the header/body gap is small.
    pub fn try_immediate_resume(&self) -> bool {
        let gap = match self.fetcher.gap() {
            Ok(gap) => gap,
            Err(err) => {
                warn!(%err, "Could not read gap for immediate resume");
                return false;
            }
        };
        if !self.near_remote_tip() || gap > self.config.resume_proximity_slots {
            return false;
        }
        self.transition(SyncPhase::SteadyState, "resumed near remote tip")
    }

    pub fn on_intersection_found(&self, point: Point) {
        *self.last_intersection.lock() = Some(point);
        *self.intersect_entered_at.lock() = Some(Instant::now());
        if !self.transition(SyncPhase::IntersectPhase, "intersection found")
            && self.phase.is(SyncPhase::IntersectPhase)
        {
            debug!(slot = point.slot, "Intersection found again, intersect timer restarted");
        }
    }

    pub fn on_intersection_not_found(&self) {
        warn!(phase = ?self.phase(), "Peer found no intersection with the local chain");
    }

    /// Headers are flowing again: the fast exit from the intersect phase.
    pub fn on_header_flow(&self) {
        if self.phase.is(SyncPhase::IntersectPhase) {
            self.exit_intersect_phase("headers resumed");
        }
    }

    fn exit_intersect_phase(&self, reason: &'static str) {
        let target = if self.near_remote_tip() {
            SyncPhase::SteadyState
        } else {
            SyncPhase::InitialSync
        };
        if self.transition(target, reason) {
            *self.intersect_entered_at.lock() = None;
        }
    }

    /// Time-driven transitions, evaluated once per monitor cycle.
    pub fn on_tick(&self, gap: u64) {
        match self.phase.load() {
            SyncPhase::IntersectPhase => {
                let expired = self
                    .intersect_entered_at
                    .lock()
                    .is_none_or(|entered| entered.elapsed() >= self.config.intersect_timeout());
                if expired {
                    self.exit_intersect_phase("intersect timeout");
                }
            }
            SyncPhase::InitialSync => {
                if gap <= self.config.resume_proximity_slots && self.near_remote_tip() {
                    self.transition(SyncPhase::SteadyState, "caught up with remote tip");
                }
            }
            SyncPhase::SteadyState => {
                if gap >= self.config.fallback_gap_slots {
                    self.transition(SyncPhase::InitialSync, "gap reopened");
                }
            }
        }
    }

    /// Rewind the store to `point` and report it downstream if it is a real
    /// reorganization.
    ///
    /// Range fetching is held for the whole operation. The hold is separate
    /// from [`BodyRangeFetcher::pause`], so a caller's pause survives it.
    pub fn handle_rollback(&self, point: Point) -> Result<RollbackKind, SyncError> {
        self.fetcher.pause_for_rollback();
        let result = self.apply_rollback(point);
        self.fetcher.end_rollback_pause();
        result
    }

    fn apply_rollback(&self, point: Point) -> Result<RollbackKind, SyncError> {
        let phase = self.phase.load();
        self.fetcher.on_rollback(point);
        let tip_before = self.store.tip()?;
        if let Some(tip) = tip_before {
            if point.slot <= self.config.catastrophic_rollback_slot
                && tip.block_number >= self.config.catastrophic_min_height
            {
                error!(
                    target_slot = point.slot,
                    tip_slot = tip.slot,
                    tip_block_number = tip.block_number,
                    "Refusing near-genesis rollback of a long chain"
                );
                return Err(SyncError::CatastrophicRollback {
                    target_slot: point.slot,
                    tip_block_number: tip.block_number,
                });
            }
        }

        self.store.rollback_to(point.slot)?;
        let tip_after = self.store.tip()?;

        let kind = classify_rollback(phase, &point, tip_before, tip_after);
        self.metrics.inc_rollbacks(kind.label());
        if let Some(tip) = tip_after {
            self.metrics.set_tip(tip.slot, tip.block_number);
        }
        if let Ok(Some(header_tip)) = self.store.header_tip() {
            self.metrics.set_header_tip_slot(header_tip.slot);
        }

        match kind {
            RollbackKind::Real => {
                self.real_rollbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    slot = point.slot,
                    hash = %point.hash,
                    tip_before = ?tip_before.map(|tip| tip.slot),
                    "Chain reorganization"
                );
                self.notifier.notify_real_rollback(point);
            }
            RollbackKind::ReconnectionArtifact => {
                self.suppressed_rollbacks.fetch_add(1, Ordering::Relaxed);
                debug!(slot = point.slot, ?phase, "Rollback treated as reconnection replay");
            }
        }

        Ok(kind)
    }

    /// New body stored; relayed downstream only while following the tip.
    pub fn on_block_stored(&self) {
        if self.phase.is(SyncPhase::SteadyState) {
            self.notifier.notify_new_block_stored();
        }
    }

    pub fn last_intersection(&self) -> Option<Point> {
        *self.last_intersection.lock()
    }

    pub fn real_rollbacks(&self) -> u64 {
        self.real_rollbacks.load(Ordering::Relaxed)
    }

    pub fn suppressed_rollbacks(&self) -> u64 {
        self.suppressed_rollbacks.load(Ordering::Relaxed)
    }
}
