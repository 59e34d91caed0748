use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chain::{ChainStore, InMemoryChainStore, RangeEnd, StoreError};
use containers::{Block, ChainTip, Era, Hash32, Header, Point, SlotConfig};
use metrics::{Metrics, SharedMetrics};
use parking_lot::{Condvar, Mutex};

use crate::sync::{
    BodyRangeFetcher, HeaderStreamConsumer, PeerChannel, PhaseCell, RelayNotifier, SyncConfig,
    SyncPhase, SyncPhaseCoordinator,
};

// Mock block-fetch session for testing
pub struct MockPeer {
    requests: Mutex<Vec<(Point, Point)>>,
    pub fail: AtomicBool,
    pub running: AtomicBool,
    latest: Mutex<Option<ChainTip>>,
}

impl MockPeer {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            running: AtomicBool::new(true),
            latest: Mutex::new(None),
        }
    }

    pub fn set_latest(&self, tip: Option<ChainTip>) {
        *self.latest.lock() = tip;
    }

    pub fn requests(&self) -> Vec<(Point, Point)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl PeerChannel for MockPeer {
    async fn fetch_range(&self, from: Point, to: Point) -> anyhow::Result<()> {
        // Let concurrently polled ticks interleave with this one.
        tokio::task::yield_now().await;
        if self.fail.load(Ordering::Acquire) {
            anyhow::bail!("session closed");
        }
        self.requests.lock().push((from, to));
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn latest_tip(&self) -> Option<ChainTip> {
        *self.latest.lock()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    rollbacks: Mutex<Vec<Point>>,
    new_blocks: AtomicU64,
}

impl RecordingNotifier {
    pub fn rollbacks(&self) -> Vec<Point> {
        self.rollbacks.lock().clone()
    }

    pub fn new_blocks(&self) -> u64 {
        self.new_blocks.load(Ordering::Relaxed)
    }
}

impl RelayNotifier for RecordingNotifier {
    fn notify_real_rollback(&self, point: Point) {
        self.rollbacks.lock().push(point);
    }

    fn notify_new_block_stored(&self) {
        self.new_blocks.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory store with injectable faults: failing writes, a scripted
/// corruption probe, and a gate that holds the probe (and, if asked, the
/// batch range walk) until opened.
pub struct FaultyStore {
    pub inner: InMemoryChainStore,
    pub fail_writes: AtomicBool,
    pub corrupted: AtomicBool,
    pub recovery_fails: AtomicBool,
    pub hold_range_walk: AtomicBool,
    probes: AtomicU64,
    range_walks: AtomicU64,
    gate: Mutex<bool>,
    gate_cv: Condvar,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryChainStore::new(),
            fail_writes: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            recovery_fails: AtomicBool::new(false),
            hold_range_walk: AtomicBool::new(false),
            probes: AtomicU64::new(0),
            range_walks: AtomicU64::new(0),
            gate: Mutex::new(true),
            gate_cv: Condvar::new(),
        }
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Acquire)
    }

    pub fn range_walks(&self) -> u64 {
        self.range_walks.load(Ordering::Acquire)
    }

    pub fn close_gate(&self) {
        *self.gate.lock() = false;
    }

    pub fn open_gate(&self) {
        *self.gate.lock() = true;
        self.gate_cv.notify_all();
    }

    fn wait_for_gate(&self) {
        let mut open = self.gate.lock();
        while !*open {
            self.gate_cv.wait(&mut open);
        }
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        Ok(())
    }
}

/// Opens the store gate when dropped so a failing assertion never leaves a
/// blocking probe parked.
pub struct GateGuard(pub Arc<FaultyStore>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.0.open_gate();
    }
}

impl ChainStore for FaultyStore {
    fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        self.inner.tip()
    }

    fn header_tip(&self) -> Result<Option<ChainTip>, StoreError> {
        self.inner.header_tip()
    }

    fn store_block(&self, hash: Hash32, block_number: u64, slot: u64, bytes: &[u8]) -> Result<(), StoreError> {
        self.check_writes()?;
        self.inner.store_block(hash, block_number, slot, bytes)
    }

    fn store_block_header(&self, hash: Hash32, block_number: u64, slot: u64, bytes: &[u8]) -> Result<(), StoreError> {
        self.check_writes()?;
        self.inner.store_block_header(hash, block_number, slot, bytes)
    }

    fn block_by_number(&self, block_number: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.block_by_number(block_number)
    }

    fn block_header(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.block_header(hash)
    }

    fn first_block(&self) -> Result<Option<Point>, StoreError> {
        self.inner.first_block()
    }

    fn find_next_block_header(&self, after: &Point) -> Result<Option<Point>, StoreError> {
        self.inner.find_next_block_header(after)
    }

    fn find_last_point_after_n_blocks(&self, from: &Point, n: u32) -> Result<Option<RangeEnd>, StoreError> {
        self.range_walks.fetch_add(1, Ordering::AcqRel);
        if self.hold_range_walk.load(Ordering::Acquire) {
            self.wait_for_gate();
        }
        self.inner.find_last_point_after_n_blocks(from, n)
    }

    fn rollback_to(&self, slot: u64) -> Result<(), StoreError> {
        self.inner.rollback_to(slot)
    }

    fn detect_corruption(&self) -> Result<bool, StoreError> {
        self.probes.fetch_add(1, Ordering::AcqRel);
        self.wait_for_gate();
        Ok(self.corrupted.load(Ordering::Acquire))
    }

    fn recover_from_corruption(&self) -> Result<(), StoreError> {
        if self.recovery_fails.load(Ordering::Acquire) {
            return Err(StoreError::RecoveryFailed("block index unreadable".to_string()));
        }
        self.corrupted.store(false, Ordering::Release);
        Ok(())
    }
}

pub type TestFetcher<S> = BodyRangeFetcher<S, MockPeer>;

/// Sync components wired the way the service wires them.
pub struct Harness<S: ChainStore = InMemoryChainStore> {
    pub store: Arc<S>,
    pub peer: Arc<MockPeer>,
    pub notifier: Arc<RecordingNotifier>,
    pub phase: Arc<PhaseCell>,
    pub config: SyncConfig,
    pub headers: HeaderStreamConsumer<S>,
    pub fetcher: Arc<TestFetcher<S>>,
    pub coordinator: SyncPhaseCoordinator<S, MockPeer, RecordingNotifier>,
}

impl Harness<InMemoryChainStore> {
    pub fn new(config: SyncConfig) -> Self {
        Harness::with_store(Arc::new(InMemoryChainStore::new()), config)
    }
}

impl<S: ChainStore + 'static> Harness<S> {
    pub fn with_store(store: Arc<S>, config: SyncConfig) -> Self {
        let peer = Arc::new(MockPeer::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let phase = Arc::new(PhaseCell::new(SyncPhase::InitialSync));
        let metrics = test_metrics();

        let headers = HeaderStreamConsumer::new(store.clone(), config.clone(), phase.clone(), metrics.clone());
        let fetcher = Arc::new(BodyRangeFetcher::new(
            store.clone(),
            peer.clone(),
            config.clone(),
            phase.clone(),
            metrics.clone(),
        ));
        let coordinator = SyncPhaseCoordinator::new(
            store.clone(),
            peer.clone(),
            notifier.clone(),
            fetcher.clone(),
            phase.clone(),
            config.clone(),
            metrics,
        );

        Self {
            store,
            peer,
            notifier,
            phase,
            config,
            headers,
            fetcher,
            coordinator,
        }
    }

    pub fn store_headers(&self, headers: &[Header]) {
        for header in headers {
            self.headers.on_header(header, &header_bytes());
        }
    }

    pub fn store_bodies(&self, headers: &[Header]) {
        for header in headers {
            self.fetcher.on_block(&block(header));
        }
    }

    pub fn point_of(&self, header: &Header) -> Point {
        header.point(&self.config.slots)
    }
}

pub fn test_metrics() -> SharedMetrics {
    Arc::new(Metrics::new())
}

pub fn hash(n: u64) -> Hash32 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xab;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    Hash32(bytes)
}

fn header_hash(slot: u64, block_number: u64, tag: u8) -> Hash32 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[8..16].copy_from_slice(&slot.to_be_bytes());
    bytes[16..24].copy_from_slice(&block_number.to_be_bytes());
    Hash32(bytes)
}

pub fn shelley_header(slot: u64, block_number: u64) -> Header {
    Header::Shelley {
        era: Era::Babbage,
        slot,
        block_number,
        hash: header_hash(slot, block_number, 0x5e),
    }
}

pub fn era_header(era: Era, slot: u64, block_number: u64) -> Header {
    Header::Shelley {
        era,
        slot,
        block_number,
        hash: header_hash(slot, block_number, 0x5e),
    }
}

pub fn byron_main(epoch: u64, slot_in_epoch: u64, block_number: u64) -> Header {
    let slot = SlotConfig::default().byron_absolute_slot(epoch, slot_in_epoch);
    Header::ByronMain {
        epoch,
        slot_in_epoch,
        block_number,
        hash: header_hash(slot, block_number, 0xb1),
    }
}

pub fn ebb(epoch: u64, block_number: u64) -> Header {
    let slot = SlotConfig::default().byron_ebb_slot(epoch);
    Header::ByronEbb {
        epoch,
        block_number,
        hash: header_hash(slot, block_number, 0xeb),
    }
}

/// Shelley headers for blocks `1..=n`, twenty slots apart starting at slot 1020.
pub fn shelley_chain(n: u64) -> Vec<Header> {
    (1..=n).map(|block_number| shelley_header(1_000 + 20 * block_number, block_number)).collect()
}

pub fn header_bytes() -> Vec<u8> {
    vec![0x82, 0x00, 0x01]
}

pub fn block(header: &Header) -> Block {
    Block::new(header.clone(), vec![0x85; 16])
}

pub fn tip_of(header: &Header) -> ChainTip {
    let slots = SlotConfig::default();
    ChainTip::new(header.absolute_slot(&slots), header.block_number(), header.hash())
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Awaits `future` with a hard limit so a hung task fails the test instead of
/// stalling it.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    match tokio::time::timeout(timeout, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {timeout:?}"),
    }
}
