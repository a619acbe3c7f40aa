pub mod ledger;
pub mod portfolio;

pub use ledger::*;
pub use portfolio::*;
