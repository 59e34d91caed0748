pub mod config;
pub mod error;
pub mod memory;
pub mod store;

pub use config::NetworkParams;
pub use error::StoreError;
pub use memory::InMemoryChainStore;
pub use store::{ChainStore, RangeEnd};
