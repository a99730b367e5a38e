pub mod journal;
pub mod manager;

pub use journal::TxnJournal;
pub use manager::{Participant, ResourceManager};

use wayfare_shared::TxnId;

/// Systemic and protocol failures. Business refusals never end up here,
/// they travel as `Ok(false)` or sentinel values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid transaction {0}: {1}")]
    InvalidTransaction(TxnId, String),
    #[error("Transaction {0} aborted: {1}")]
    TransactionAborted(TxnId, String),
    #[error("Transaction {0} timed out")]
    TransactionTimedOut(TxnId),
    #[error("Resource manager unavailable: {0}")]
    Unavailable(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Journal error: {0}")]
    Journal(String),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transport-level failures count as an abort vote and force an abort
    /// of the enclosing transaction.
    pub fn is_systemic(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::Protocol(_))
    }

    /// Short machine readable kind, stable across the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidTransaction(..) => "invalid_transaction",
            CoreError::TransactionAborted(..) => "aborted",
            CoreError::TransactionTimedOut(_) => "timeout",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Protocol(_) => "protocol",
            CoreError::Journal(_) => "journal",
            CoreError::Internal(_) => "internal",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
