/// Sync phase state machine.
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Bulk catch-up: far behind the remote tip.
    ///
    /// The monitor polls at the configured interval and only fetches once
    /// the header/body gap reaches the gap threshold, so each round-trip
    /// carries many blocks.
    InitialSync,

    /// An intersection was just found on a new session.
    ///
    /// A reconnection-induced rollback reliably follows, so rollbacks seen
    /// here are never reported downstream. Left as soon as headers resume
    /// flowing, or after the intersect timeout.
    IntersectPhase,

    /// Following the remote tip.
    ///
    /// The monitor polls every 100 ms and fetches on any new header. Only
    /// rollbacks observed in this phase can be real reorganizations.
    SteadyState,
}

impl SyncPhase {
    /// Check if a transition to the target phase is valid.
    pub fn can_transition_to(&self, target: SyncPhase) -> bool {
        match self {
            SyncPhase::InitialSync => matches!(
                target,
                SyncPhase::IntersectPhase | SyncPhase::SteadyState
            ),
            SyncPhase::IntersectPhase => matches!(
                target,
                SyncPhase::InitialSync | SyncPhase::SteadyState
            ),
            SyncPhase::SteadyState => matches!(
                target,
                SyncPhase::IntersectPhase | SyncPhase::InitialSync
            ),
        }
    }

    /// Numeric value exported through the `sync_phase` gauge.
    pub fn as_u8(&self) -> u8 {
        match self {
            SyncPhase::InitialSync => 0,
            SyncPhase::IntersectPhase => 1,
            SyncPhase::SteadyState => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::IntersectPhase,
            2 => SyncPhase::SteadyState,
            _ => SyncPhase::InitialSync,
        }
    }
}

impl Default for SyncPhase {
    fn default() -> Self {
        SyncPhase::InitialSync
    }
}

/// Phase shared between the callback context and the monitor task.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new(phase: SyncPhase) -> Self {
        Self(AtomicU8::new(phase.as_u8()))
    }

    pub fn load(&self) -> SyncPhase {
        SyncPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, phase: SyncPhase) {
        self.0.store(phase.as_u8(), Ordering::Release);
    }

    /// Moves from `current` to `target` only if no one else changed the phase
    /// in between.
    pub fn compare_and_set(&self, current: SyncPhase, target: SyncPhase) -> bool {
        self.0
            .compare_exchange(
                current.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is(&self, phase: SyncPhase) -> bool {
        self.load() == phase
    }
}
