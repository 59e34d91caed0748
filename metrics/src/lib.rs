pub mod server;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    // Chain position
    header_tip_slot: IntGauge,
    tip_slot: IntGauge,
    tip_block_number: IntGauge,
    sync_gap_slots: IntGauge,
    sync_phase: IntGauge,
    // Header stream
    headers_received: IntCounterVec,
    // Body fetch
    bodies_received: IntCounter,
    stale_blocks: IntCounter,
    batches_issued: IntCounter,
    batches_completed: IntCounter,
    batch_fetch_failures: IntCounter,
    no_block_found: IntCounter,
    batch_duration: HistogramVec,
    // Reconciliation
    rollbacks: IntCounterVec,
    corruption_probes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let header_tip_slot = IntGauge::with_opts(Opts::new("sync_header_tip_slot", "Slot of the furthest stored header")).unwrap();
        registry.register(Box::new(header_tip_slot.clone())).unwrap();

        let tip_slot = IntGauge::with_opts(Opts::new("sync_tip_slot", "Slot of the furthest stored block body")).unwrap();
        registry.register(Box::new(tip_slot.clone())).unwrap();

        let tip_block_number = IntGauge::with_opts(Opts::new("sync_tip_block_number", "Block number of the furthest stored block body")).unwrap();
        registry.register(Box::new(tip_block_number.clone())).unwrap();

        let sync_gap_slots = IntGauge::with_opts(Opts::new("sync_gap_slots", "Slots between header tip and body tip")).unwrap();
        registry.register(Box::new(sync_gap_slots.clone())).unwrap();

        let sync_phase = IntGauge::with_opts(Opts::new(
            "sync_phase",
            "Current sync phase (0 = initial sync, 1 = intersect, 2 = steady state)",
        )).unwrap();
        registry.register(Box::new(sync_phase.clone())).unwrap();

        let headers_received = IntCounterVec::new(
            Opts::new("sync_headers_received_total", "Total number of headers stored"),
            &["era"],
        ).unwrap();
        registry.register(Box::new(headers_received.clone())).unwrap();

        let bodies_received = IntCounter::with_opts(Opts::new("sync_bodies_received_total", "Total number of block bodies stored")).unwrap();
        registry.register(Box::new(bodies_received.clone())).unwrap();

        let stale_blocks = IntCounter::with_opts(Opts::new("sync_stale_blocks_total", "Total number of block bodies discarded as stale")).unwrap();
        registry.register(Box::new(stale_blocks.clone())).unwrap();

        let batches_issued = IntCounter::with_opts(Opts::new("sync_batches_issued_total", "Total number of range fetches issued")).unwrap();
        registry.register(Box::new(batches_issued.clone())).unwrap();

        let batches_completed = IntCounter::with_opts(Opts::new("sync_batches_completed_total", "Total number of range fetches completed")).unwrap();
        registry.register(Box::new(batches_completed.clone())).unwrap();

        let batch_fetch_failures = IntCounter::with_opts(Opts::new("sync_batch_fetch_failures_total", "Total number of range fetches that failed to issue")).unwrap();
        registry.register(Box::new(batch_fetch_failures.clone())).unwrap();

        let no_block_found = IntCounter::with_opts(Opts::new("sync_no_block_found_total", "Total number of range fetches answered with no blocks")).unwrap();
        registry.register(Box::new(no_block_found.clone())).unwrap();

        let batch_duration = HistogramVec::new(
            HistogramOpts::new("sync_batch_duration_seconds", "Time from range fetch issuance to batch completion")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(batch_duration.clone())).unwrap();

        let rollbacks = IntCounterVec::new(
            Opts::new("sync_rollbacks_total", "Total number of rollbacks handled"),
            &["kind"],
        ).unwrap();
        registry.register(Box::new(rollbacks.clone())).unwrap();

        let corruption_probes = IntCounterVec::new(
            Opts::new("sync_corruption_probes_total", "Total number of chain store corruption probes"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(corruption_probes.clone())).unwrap();

        Self {
            registry,
            header_tip_slot,
            tip_slot,
            tip_block_number,
            sync_gap_slots,
            sync_phase,
            headers_received,
            bodies_received,
            stale_blocks,
            batches_issued,
            batches_completed,
            batch_fetch_failures,
            no_block_found,
            batch_duration,
            rollbacks,
            corruption_probes,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    pub fn set_header_tip_slot(&self, v: u64) {
        self.header_tip_slot.set(v as i64);
    }

    pub fn set_tip(&self, slot: u64, block_number: u64) {
        self.tip_slot.set(slot as i64);
        self.tip_block_number.set(block_number as i64);
    }

    pub fn set_gap(&self, v: u64) {
        self.sync_gap_slots.set(v as i64);
    }

    pub fn set_phase(&self, v: i64) {
        self.sync_phase.set(v);
    }

    pub fn inc_headers_received(&self, era: &str) {
        self.headers_received.with_label_values(&[era]).inc();
    }

    pub fn inc_bodies_received(&self) {
        self.bodies_received.inc();
    }

    pub fn inc_stale_blocks(&self) {
        self.stale_blocks.inc();
    }

    pub fn inc_batches_issued(&self) {
        self.batches_issued.inc();
    }

    pub fn inc_batches_completed(&self) {
        self.batches_completed.inc();
    }

    pub fn inc_batch_fetch_failures(&self) {
        self.batch_fetch_failures.inc();
    }

    pub fn inc_no_block_found(&self) {
        self.no_block_found.inc();
    }

    pub fn observe_batch_duration(&self, duration: f64) {
        self.batch_duration.with_label_values::<&str>(&[]).observe(duration);
    }

    pub fn inc_rollbacks(&self, kind: &str) {
        self.rollbacks.with_label_values(&[kind]).inc();
    }

    pub fn inc_corruption_probes(&self, result: &str) {
        self.corruption_probes.with_label_values(&[result]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_sync_families() {
        let metrics = Metrics::new();
        metrics.inc_headers_received("byron");
        metrics.inc_rollbacks("real");
        metrics.inc_corruption_probes("clean");
        metrics.set_gap(5);

        let text = metrics.gather();
        assert!(text.contains("sync_headers_received_total{era=\"byron\"} 1"));
        assert!(text.contains("sync_rollbacks_total{kind=\"real\"} 1"));
        assert!(text.contains("sync_corruption_probes_total{result=\"clean\"} 1"));
        assert!(text.contains("sync_gap_slots 5"));
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.inc_bodies_received();
        assert!(a.gather().contains("sync_bodies_received_total 1"));
        assert!(b.gather().contains("sync_bodies_received_total 0"));
    }
}
