use containers::SlotConfig;

pub const MAINNET_BYRON_SLOTS_PER_EPOCH: u64 = 21_600;
pub const PREPROD_BYRON_SLOTS_PER_EPOCH: u64 = 21_600;
pub const PREVIEW_BYRON_SLOTS_PER_EPOCH: u64 = 4_320;

pub const MAINNET_PROTOCOL_MAGIC: u32 = 764_824_073;
pub const PREPROD_PROTOCOL_MAGIC: u32 = 1;
pub const PREVIEW_PROTOCOL_MAGIC: u32 = 2;

/// Slot distance under which the local chain counts as "near the remote tip".
///
/// Tuned for one-second Shelley slots; networks with other slot durations
/// should override it through the sync configuration.
pub const NEAR_TIP_SLOTS: u64 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkParams {
    pub name: &'static str,
    pub protocol_magic: u32,
    pub slots: SlotConfig,
    pub near_tip_slots: u64,
}

impl NetworkParams {
    pub fn by_name(name: &str) -> Option<&'static NetworkParams> {
        match name {
            "mainnet" => Some(&MAINNET),
            "preprod" => Some(&PREPROD),
            "preview" => Some(&PREVIEW),
            _ => None,
        }
    }

    pub fn by_magic(magic: u32) -> Option<&'static NetworkParams> {
        [&MAINNET, &PREPROD, &PREVIEW]
            .into_iter()
            .find(|params| params.protocol_magic == magic)
    }
}

pub const MAINNET: NetworkParams = NetworkParams {
    name: "mainnet",
    protocol_magic: MAINNET_PROTOCOL_MAGIC,
    slots: SlotConfig::new(MAINNET_BYRON_SLOTS_PER_EPOCH),
    near_tip_slots: NEAR_TIP_SLOTS,
};

pub const PREPROD: NetworkParams = NetworkParams {
    name: "preprod",
    protocol_magic: PREPROD_PROTOCOL_MAGIC,
    slots: SlotConfig::new(PREPROD_BYRON_SLOTS_PER_EPOCH),
    near_tip_slots: NEAR_TIP_SLOTS,
};

pub const PREVIEW: NetworkParams = NetworkParams {
    name: "preview",
    protocol_magic: PREVIEW_PROTOCOL_MAGIC,
    slots: SlotConfig::new(PREVIEW_BYRON_SLOTS_PER_EPOCH),
    near_tip_slots: NEAR_TIP_SLOTS,
};
