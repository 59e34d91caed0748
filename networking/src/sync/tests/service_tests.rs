use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chain::{ChainStore, InMemoryChainStore};
use containers::{ChainTip, Point};
use pretty_assertions::assert_eq;

use super::common::*;
use crate::sync::{ChainSyncListener, SyncConfig, SyncError, SyncPhase, SyncService, TickOutcome};

const TASK_TIMEOUT: Duration = Duration::from_secs(2);

type TestService<S> = SyncService<S, MockPeer, RecordingNotifier>;

fn build_service<S: ChainStore + 'static>(
    store: Arc<S>,
    config: SyncConfig,
) -> (Arc<TestService<S>>, Arc<MockPeer>, Arc<RecordingNotifier>) {
    let peer = Arc::new(MockPeer::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let service = Arc::new(SyncService::new(
        store,
        peer.clone(),
        notifier.clone(),
        config,
        test_metrics(),
    ));
    (service, peer, notifier)
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        monitor_interval_ms: 10,
        steady_state_interval_ms: 5,
        ..SyncConfig::default()
    }
}

#[test]
fn test_sync_service_creation() {
    let (service, _peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), SyncConfig::default());

    assert_eq!(service.phase(), SyncPhase::InitialSync);

    let status = service.status();
    assert!(!status.running);
    assert!(!status.paused);
    assert_eq!(status.gap, 0);
    assert_eq!(status.headers_received, 0);
    assert_eq!(status.last_header_slot, None);
    assert_eq!(status.last_body_slot, None);
    assert_eq!(status.last_rollback, None);
}

#[tokio::test]
async fn test_headers_then_bodies_close_the_gap() {
    let store = Arc::new(InMemoryChainStore::new());
    let (service, peer, notifier) = build_service(store.clone(), SyncConfig::default());
    let chain = shelley_chain(10);

    for header in &chain {
        service.on_header(header.clone(), &header_bytes());
    }
    assert_eq!(service.status().gap, 1_200);

    let TickOutcome::Issued(batch) = service.tick().await else {
        panic!("expected a range fetch");
    };
    assert_eq!(batch.size, 10);
    assert_eq!(peer.request_count(), 1);

    service.on_batch_started();
    for header in &chain {
        service.on_block(block(header));
    }
    service.on_batch_done();

    let status = service.status();
    assert_eq!(status.gap, 0);
    assert_eq!(status.headers_received, 10);
    assert_eq!(status.bodies_received, 10);
    assert_eq!(status.batches_completed, 1);
    assert_eq!(status.stale_blocks, 0);
    assert!(!status.batch_in_flight);
    assert_eq!(status.last_body_block_number, Some(10));
    assert_eq!(status.last_header_slot, Some(1_200));
    assert_eq!(store.tip().unwrap(), Some(tip_of(&chain[9])));
    assert_eq!(notifier.new_blocks(), 0);
}

#[tokio::test]
async fn test_reconnection_replay_is_suppressed() {
    let store = Arc::new(InMemoryChainStore::new());
    let (service, peer, notifier) = build_service(store.clone(), SyncConfig::default());
    let chain = shelley_chain(50);
    for header in &chain[..45] {
        service.on_header(header.clone(), &header_bytes());
        service.on_block(block(header));
    }
    peer.set_latest(Some(ChainTip::new(2_010, 50, hash(50))));

    assert_eq!(service.tick().await, TickOutcome::BelowThreshold { gap: 0 });
    assert_eq!(service.phase(), SyncPhase::SteadyState);

    let intersection = chain[44].point(&Default::default());
    service.on_disconnect();
    service.on_intersection_found(intersection);
    assert_eq!(service.phase(), SyncPhase::IntersectPhase);

    service.on_rollback(intersection).unwrap();
    assert_eq!(notifier.rollbacks(), Vec::<Point>::new());
    assert_eq!(service.status().last_rollback, Some(intersection));

    service.on_header(chain[45].clone(), &header_bytes());
    assert_eq!(service.phase(), SyncPhase::SteadyState);

    service.on_block(block(&chain[45]));
    assert_eq!(notifier.new_blocks(), 1);
    assert_eq!(store.tip().unwrap(), Some(tip_of(&chain[45])));
}

#[tokio::test]
async fn test_steady_state_reorganization_is_relayed() {
    let store = Arc::new(InMemoryChainStore::new());
    let (service, peer, notifier) = build_service(store.clone(), SyncConfig::default());
    let chain = shelley_chain(50);
    for header in &chain {
        service.on_header(header.clone(), &header_bytes());
        service.on_block(block(header));
    }
    peer.set_latest(Some(ChainTip::new(2_000, 50, hash(50))));
    service.tick().await;
    assert_eq!(service.phase(), SyncPhase::SteadyState);

    let target = chain[40].point(&Default::default());
    service.on_rollback(target).unwrap();

    assert_eq!(notifier.rollbacks(), vec![target]);
    assert_eq!(store.tip().unwrap(), Some(tip_of(&chain[40])));
    assert_eq!(service.coordinator().real_rollbacks(), 1);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (service, peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), SyncConfig::default());
    for header in shelley_chain(200) {
        service.on_header(header, &header_bytes());
    }

    service.pause();
    assert!(service.status().paused);
    assert_eq!(service.tick().await, TickOutcome::Paused);
    assert_eq!(peer.request_count(), 0);

    service.resume();
    assert!(matches!(service.tick().await, TickOutcome::Issued(_)));
}

#[tokio::test]
async fn test_disconnect_abandons_batch() {
    let (service, _peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), SyncConfig::default());
    for header in shelley_chain(200) {
        service.on_header(header, &header_bytes());
    }

    assert!(matches!(service.tick().await, TickOutcome::Issued(_)));
    assert!(service.status().batch_in_flight);

    service.on_disconnect();
    assert!(!service.status().batch_in_flight);
}

#[tokio::test]
async fn test_monitor_issues_single_flight_fetches() {
    let (service, peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), fast_config());
    for header in shelley_chain(200) {
        service.on_header(header, &header_bytes());
    }

    let handle = service.start();
    assert!(wait_until(TASK_TIMEOUT, || peer.request_count() == 1).await);
    assert!(service.status().running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peer.request_count(), 1);

    service.on_batch_done();
    assert!(wait_until(TASK_TIMEOUT, || peer.request_count() == 2).await);

    service.stop();
    let result = within(TASK_TIMEOUT, handle).await.expect("monitor task panicked");
    assert!(result.is_ok());
    assert!(!service.status().running);
}

#[tokio::test]
async fn test_monitor_waits_for_running_peer() {
    let (service, peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), fast_config());
    peer.running.store(false, Ordering::Release);
    for header in shelley_chain(200) {
        service.on_header(header, &header_bytes());
    }

    let handle = service.start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(peer.request_count(), 0);

    peer.running.store(true, Ordering::Release);
    assert!(wait_until(TASK_TIMEOUT, || peer.request_count() == 1).await);

    service.stop();
    assert!(within(TASK_TIMEOUT, handle).await.expect("monitor task panicked").is_ok());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let (service, _peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), fast_config());

    let first = service.start();
    let second = service.start();
    assert!(within(TASK_TIMEOUT, second).await.expect("second start panicked").is_ok());
    assert!(service.status().running);

    service.stop();
    assert!(within(TASK_TIMEOUT, first).await.expect("monitor task panicked").is_ok());
}

#[tokio::test]
async fn test_start_resumes_in_steady_state_near_tip() {
    let (service, peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), fast_config());
    for header in shelley_chain(20) {
        service.on_header(header.clone(), &header_bytes());
        service.on_block(block(&header));
    }
    peer.set_latest(Some(ChainTip::new(1_420, 21, hash(21))));

    let handle = service.start();
    assert_eq!(service.phase(), SyncPhase::SteadyState);

    service.stop();
    assert!(within(TASK_TIMEOUT, handle).await.expect("monitor task panicked").is_ok());
}

#[tokio::test]
async fn test_monitor_fails_on_unrepairable_store() {
    let store = Arc::new(FaultyStore::new());
    store.corrupted.store(true, Ordering::Release);
    store.recovery_fails.store(true, Ordering::Release);
    let (service, _peer, _notifier) = build_service(store.clone(), fast_config());

    let stale = block(&shelley_header(5_000, 5));
    for _ in 0..crate::sync::STALE_RECOVERY_THRESHOLD {
        service.on_block(stale.clone());
    }
    assert!(wait_until(TASK_TIMEOUT, || service.fetcher().fatal_error().is_some()).await);

    let handle = service.start();
    let result = within(TASK_TIMEOUT, handle).await.expect("monitor task panicked");

    assert!(matches!(result, Err(SyncError::UnrecoverableCorruption(_))));
    assert_eq!(store.probes(), 1);
}

#[test]
fn test_callbacks_after_stop_are_noops() {
    let store = Arc::new(InMemoryChainStore::new());
    let (service, _peer, notifier) = build_service(store.clone(), SyncConfig::default());
    let chain = shelley_chain(3);

    service.stop();
    assert!(service.is_stopped());

    service.on_header(chain[0].clone(), &header_bytes());
    service.on_block(block(&chain[0]));
    service.on_batch_done();
    service.on_intersection_found(chain[0].point(&Default::default()));
    service.on_rollback(Point::new(0, hash(0))).unwrap();

    let status = service.status();
    assert_eq!(status.headers_received, 0);
    assert_eq!(status.bodies_received, 0);
    assert_eq!(status.batches_completed, 0);
    assert_eq!(status.phase, SyncPhase::InitialSync);
    assert_eq!(status.last_rollback, None);
    assert_eq!(store.header_count(), 0);
    assert_eq!(notifier.rollbacks(), Vec::<Point>::new());
}

#[test]
fn test_status_serializes_as_json() {
    let (service, _peer, _notifier) = build_service(Arc::new(InMemoryChainStore::new()), SyncConfig::default());
    service.on_header(shelley_header(1_000, 1), &header_bytes());

    let value = serde_json::to_value(service.status()).unwrap();

    assert_eq!(value["phase"], "initial_sync");
    assert_eq!(value["gap"], 1_000);
    assert_eq!(value["last_header_block_number"], 1);
    assert_eq!(value["last_rollback"], serde_json::Value::Null);
}
