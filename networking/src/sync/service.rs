/// Sync service coordinating all synchronization operations.
///
/// The SyncService is the main entry point for synchronization. It coordinates:
/// - HeaderStreamConsumer: Storing headers from chain-sync
/// - BodyRangeFetcher: Closing the header/body gap with range fetches
/// - SyncPhaseCoordinator: Phase transitions and rollback classification
/// - Monitor task: Driving the fetcher on an adaptive interval
use chain::ChainStore;
use containers::{Block, Header, Point};
use metrics::SharedMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    body_fetcher::{BlockOutcome, BodyRangeFetcher, TickOutcome},
    config::SyncConfig,
    coordinator::SyncPhaseCoordinator,
    error::SyncError,
    header_sync::{HeaderOutcome, HeaderStreamConsumer},
    peer::{ChainSyncListener, PeerChannel, RelayNotifier},
    states::{PhaseCell, SyncPhase},
};

/// Sync service coordinating all sync operations.
///
/// This is the main sync coordinator that:
/// 1. Receives session callbacks and routes them to the owning component
/// 2. Runs the monitor task that initiates every range fetch
/// 3. Manages sync phase (INITIAL_SYNC -> INTERSECT_PHASE -> STEADY_STATE)
/// 4. Exposes a read-only status snapshot
pub struct SyncService<S: ChainStore, P: PeerChannel, R: RelayNotifier> {
    config: SyncConfig,
    phase: Arc<PhaseCell>,
    peer: Arc<P>,
    headers: HeaderStreamConsumer<S>,
    fetcher: Arc<BodyRangeFetcher<S, P>>,
    coordinator: SyncPhaseCoordinator<S, P, R>,

    monitor_running: AtomicBool,
    stop_signal: Notify,
    started_at: Instant,
}

impl<S, P, R> SyncService<S, P, R>
where
    S: ChainStore + 'static,
    P: PeerChannel + 'static,
    R: RelayNotifier + 'static,
{
    pub fn new(
        store: Arc<S>,
        peer: Arc<P>,
        notifier: Arc<R>,
        config: SyncConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let phase = Arc::new(PhaseCell::new(SyncPhase::default()));
        metrics.set_phase(SyncPhase::default().as_u8() as i64);

        let headers = HeaderStreamConsumer::new(
            store.clone(),
            config.clone(),
            phase.clone(),
            metrics.clone(),
        );
        let fetcher = Arc::new(BodyRangeFetcher::new(
            store.clone(),
            peer.clone(),
            config.clone(),
            phase.clone(),
            metrics.clone(),
        ));
        let coordinator = SyncPhaseCoordinator::new(
            store,
            peer.clone(),
            notifier,
            fetcher.clone(),
            phase.clone(),
            config.clone(),
            metrics,
        );

        Self {
            config,
            phase,
            peer,
            headers,
            fetcher,
            coordinator,
            monitor_running: AtomicBool::new(false),
            stop_signal: Notify::new(),
            started_at: Instant::now(),
        }
    }

    /// Get current sync phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase.load()
    }

    pub fn headers(&self) -> &HeaderStreamConsumer<S> {
        &self.headers
    }

    pub fn fetcher(&self) -> &Arc<BodyRangeFetcher<S, P>> {
        &self.fetcher
    }

    pub fn coordinator(&self) -> &SyncPhaseCoordinator<S, P, R> {
        &self.coordinator
    }

    pub fn pause(&self) {
        self.fetcher.pause();
    }

    pub fn resume(&self) {
        self.fetcher.resume();
    }

    /// Start the monitor task.
    ///
    /// Applies the immediate-resume heuristic first. The returned handle
    /// resolves when the service is stopped, or with an error if the chain
    /// store turned out to be unrepairable.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<(), SyncError>> {
        if self.monitor_running.swap(true, Ordering::AcqRel) {
            warn!("Sync monitor already running");
            return tokio::spawn(async { Ok(()) });
        }

        if self.coordinator.try_immediate_resume() {
            info!("Local chain is near the remote tip, starting in steady state");
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service.run_monitor().await;
            service.monitor_running.store(false, Ordering::Release);
            result
        })
    }

    /// Stop the monitor at its next wake-up and abandon any in-flight batch.
    pub fn stop(&self) {
        self.fetcher.stop();
        self.stop_signal.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.fetcher.is_stopped()
    }

    async fn run_monitor(&self) -> Result<(), SyncError> {
        info!(
            interval_ms = self.config.monitor_interval_ms,
            steady_interval_ms = self.config.steady_state_interval_ms,
            "Sync monitor started"
        );

        loop {
            let interval = if self.phase.is(SyncPhase::SteadyState) {
                self.config.steady_state_interval()
            } else {
                self.config.monitor_interval()
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop_signal.notified() => break,
            }

            if self.fetcher.is_stopped() {
                break;
            }
            if let Some(reason) = self.fetcher.fatal_error() {
                return Err(SyncError::UnrecoverableCorruption(reason));
            }
            if !self.peer.is_running() {
                debug!("Peer session not running, skipping monitor tick");
                continue;
            }

            self.tick().await;
        }

        info!("Sync monitor stopped");
        Ok(())
    }

    /// One monitor cycle: time-driven phase transitions, then gap evaluation.
    pub async fn tick(&self) -> TickOutcome {
        if let Ok(gap) = self.fetcher.gap() {
            self.coordinator.on_tick(gap);
        }
        self.fetcher.tick().await
    }

    /// Get sync status snapshot.
    pub fn status(&self) -> SyncStatus {
        let last_header = self.headers.last_header();
        let last_body = self.fetcher.last_body();

        SyncStatus {
            running: self.monitor_running.load(Ordering::Acquire) && !self.is_stopped(),
            paused: self.fetcher.is_paused(),
            phase: self.phase(),
            gap: self.fetcher.gap().unwrap_or(0),
            batch_in_flight: self.fetcher.in_flight_batch().is_some(),
            headers_received: self.headers.headers_received(),
            bodies_received: self.fetcher.bodies_received(),
            batches_completed: self.fetcher.batches_completed(),
            stale_blocks: self.fetcher.stale_total(),
            last_header_slot: last_header.map(|tip| tip.slot),
            last_header_block_number: last_header.map(|tip| tip.block_number),
            last_body_slot: last_body.map(|tip| tip.slot),
            last_body_block_number: last_body.map(|tip| tip.block_number),
            last_rollback: self.fetcher.rollback_marker().map(|marker| marker.point),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl<S, P, R> ChainSyncListener for SyncService<S, P, R>
where
    S: ChainStore + 'static,
    P: PeerChannel + 'static,
    R: RelayNotifier + 'static,
{
    fn on_header(&self, header: Header, raw_bytes: &[u8]) {
        if self.is_stopped() {
            return;
        }
        if let HeaderOutcome::Stored(_) = self.headers.on_header(&header, raw_bytes) {
            self.coordinator.on_header_flow();
        }
    }

    fn on_block(&self, block: Block) {
        if let BlockOutcome::Stored(_) = self.fetcher.on_block(&block) {
            self.coordinator.on_block_stored();
        }
    }

    fn on_batch_started(&self) {
        self.fetcher.on_batch_started();
    }

    fn on_batch_done(&self) {
        self.fetcher.on_batch_done();
    }

    fn on_no_block_found(&self, from: Point, to: Point) {
        self.fetcher.on_no_block_found(&from, &to);
    }

    fn on_rollback(&self, point: Point) -> Result<(), SyncError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.coordinator.handle_rollback(point).map(|_| ())
    }

    fn on_intersection_found(&self, point: Point) {
        if self.is_stopped() {
            return;
        }
        self.headers.on_intersection_found(&point);
        self.coordinator.on_intersection_found(point);
    }

    fn on_intersection_not_found(&self) {
        self.coordinator.on_intersection_not_found();
    }

    fn on_disconnect(&self) {
        self.headers.on_disconnect();
        self.fetcher.on_disconnect();
        debug!(phase = ?self.phase(), "Peer session disconnected");
    }
}

/// Read-only snapshot of the sync service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub paused: bool,
    pub phase: SyncPhase,
    pub gap: u64,
    pub batch_in_flight: bool,
    pub headers_received: u64,
    pub bodies_received: u64,
    pub batches_completed: u64,
    pub stale_blocks: u64,
    pub last_header_slot: Option<u64>,
    pub last_header_block_number: Option<u64>,
    pub last_body_slot: Option<u64>,
    pub last_body_block_number: Option<u64>,
    pub last_rollback: Option<Point>,
    pub uptime_secs: u64,
}
