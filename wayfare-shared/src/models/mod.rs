pub mod fault;
pub mod transaction;

pub use fault::{FaultPoint, UnknownFaultPoint};
pub use transaction::{AbortReason, JournalRecord, Outcome, Transaction, TxnStatus, JOURNAL_VERSION};
