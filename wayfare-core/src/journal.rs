use async_trait::async_trait;
use wayfare_shared::models::JournalRecord;

use crate::CoreResult;

/// Durable home of the transaction manager's metadata.
#[async_trait]
pub trait TxnJournal: Send + Sync {
    /// Returns `None` when nothing has been persisted yet.
    async fn load(&self) -> CoreResult<Option<JournalRecord>>;

    /// Replaces the persisted record.
    async fn save(&self, record: &JournalRecord) -> CoreResult<()>;
}
