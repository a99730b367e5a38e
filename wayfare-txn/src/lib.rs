pub mod manager;
pub mod registry;
pub mod sweeper;

pub use manager::{TransactionManager, TxnSettings, TxnStats};
pub use sweeper::spawn_sweeper;
