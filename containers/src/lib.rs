pub mod types;
pub mod point;
pub mod era;
pub mod header;
pub mod slot;

pub use era::Era;
pub use header::{Block, Header, HeaderKind};
pub use point::{ChainTip, Point};
pub use slot::SlotConfig;
pub use types::Hash32;
