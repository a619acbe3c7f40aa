pub mod ledger;
pub mod performance;
pub mod price_feed;
pub mod repository;
pub mod sqlite_store;

pub use ledger::{is_consistent, replay, LedgerEngine, LedgerError, TradeHistory};
pub use price_feed::{PriceFeed, SimulatedPriceFeed};
pub use repository::{LedgerRepository, MemoryLedgerStore, StoreError};
pub use sqlite_store::SqliteLedgerStore;
