use serde::{Deserialize, Serialize};

/// Slot arithmetic parameters for a network.
///
/// Byron headers carry `(epoch, slot_in_epoch)` rather than an absolute slot,
/// so converting them needs the Byron epoch length. Later eras carry absolute
/// slots directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlotConfig {
    pub byron_slots_per_epoch: u64,
}

impl SlotConfig {
    pub const fn new(byron_slots_per_epoch: u64) -> Self {
        Self {
            byron_slots_per_epoch,
        }
    }

    /// Absolute slot of a Byron main block.
    pub fn byron_absolute_slot(&self, epoch: u64, slot_in_epoch: u64) -> u64 {
        epoch * self.byron_slots_per_epoch + slot_in_epoch
    }

    /// Absolute slot of a Byron epoch boundary block: the first slot of its epoch.
    pub fn byron_ebb_slot(&self, epoch: u64) -> u64 {
        epoch * self.byron_slots_per_epoch
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self::new(21_600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byron_absolute_slot() {
        let config = SlotConfig::default();
        assert_eq!(config.byron_absolute_slot(0, 0), 0);
        assert_eq!(config.byron_absolute_slot(1, 5), 21_605);
        assert_eq!(config.byron_absolute_slot(207, 21_599), 4_492_799);
    }

    #[test]
    fn test_ebb_occupies_first_slot_of_epoch() {
        let config = SlotConfig::new(4_320);
        assert_eq!(config.byron_ebb_slot(3), 12_960);
        assert_eq!(config.byron_ebb_slot(3), config.byron_absolute_slot(3, 0));
    }
}
