/// Sync service configuration.
///
/// Operational parameters for synchronization: cadences, thresholds, batch
/// sizes and safety limits. Every field has a default, so a YAML file only
/// needs to name what it overrides.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chain::NetworkParams;
use containers::SlotConfig;
use serde::Deserialize;

/// Consecutive stale blocks that trigger a chain store corruption probe.
pub const STALE_RECOVERY_THRESHOLD: u32 = 20;

/// Monitor cadence while near the remote tip.
pub const DEFAULT_STEADY_STATE_INTERVAL_MS: u64 = 100;

/// Monitor cadence during bulk catch-up.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 500;

/// Minimum header/body gap (in slots) before a fetch is issued outside steady state.
pub const DEFAULT_GAP_THRESHOLD: u64 = 100;

/// Maximum headers covered by a single range fetch.
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 500;

/// Distance to the remote tip (in slots) that counts as "near tip".
pub const DEFAULT_NEAR_TIP_SLOTS: u64 = chain::config::NEAR_TIP_SLOTS;

/// Header/body gap (in slots) small enough to resume directly in steady state.
pub const DEFAULT_RESUME_PROXIMITY_SLOTS: u64 = 50;

/// Gap (in slots) that sends a steady-state node back to bulk sync.
pub const DEFAULT_FALLBACK_GAP_SLOTS: u64 = 2_000;

/// Time to wait for headers to resume after an intersection before leaving
/// the intersect phase anyway.
pub const DEFAULT_INTERSECT_TIMEOUT_SECS: u64 = 30;

/// Progress log cadence outside steady state.
pub const DEFAULT_LOG_EVERY_N: u64 = 1_000;

/// Rollbacks to a slot at or below this are treated as near-genesis.
pub const DEFAULT_CATASTROPHIC_ROLLBACK_SLOT: u64 = 1_000;

/// Chain height above which a near-genesis rollback is refused.
pub const DEFAULT_CATASTROPHIC_MIN_HEIGHT: u64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub monitor_interval_ms: u64,
    pub steady_state_interval_ms: u64,
    pub gap_threshold: u64,
    pub max_batch_size: u32,
    pub near_tip_slots: u64,
    pub resume_proximity_slots: u64,
    pub fallback_gap_slots: u64,
    pub intersect_timeout_secs: u64,
    pub log_every_n: u64,
    pub catastrophic_rollback_slot: u64,
    pub catastrophic_min_height: u64,
    pub slots: SlotConfig,
}

impl SyncConfig {
    /// Defaults with the slot parameters of a known network.
    pub fn for_network(network: &NetworkParams) -> Self {
        Self {
            near_tip_slots: network.near_tip_slots,
            slots: network.slots,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SyncConfig = serde_yaml::from_str(yaml).context("invalid sync config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_batch_size > 0, "max_batch_size must be positive");
        ensure!(self.gap_threshold > 0, "gap_threshold must be positive");
        ensure!(self.monitor_interval_ms > 0, "monitor_interval_ms must be positive");
        ensure!(
            self.steady_state_interval_ms > 0,
            "steady_state_interval_ms must be positive"
        );
        ensure!(self.log_every_n > 0, "log_every_n must be positive");
        ensure!(
            self.slots.byron_slots_per_epoch > 0,
            "slots.byron_slots_per_epoch must be positive"
        );
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn steady_state_interval(&self) -> Duration {
        Duration::from_millis(self.steady_state_interval_ms)
    }

    pub fn intersect_timeout(&self) -> Duration {
        Duration::from_secs(self.intersect_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            steady_state_interval_ms: DEFAULT_STEADY_STATE_INTERVAL_MS,
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            near_tip_slots: DEFAULT_NEAR_TIP_SLOTS,
            resume_proximity_slots: DEFAULT_RESUME_PROXIMITY_SLOTS,
            fallback_gap_slots: DEFAULT_FALLBACK_GAP_SLOTS,
            intersect_timeout_secs: DEFAULT_INTERSECT_TIMEOUT_SECS,
            log_every_n: DEFAULT_LOG_EVERY_N,
            catastrophic_rollback_slot: DEFAULT_CATASTROPHIC_ROLLBACK_SLOT,
            catastrophic_min_height: DEFAULT_CATASTROPHIC_MIN_HEIGHT,
            slots: SlotConfig::default(),
        }
    }
}
