use crate::ids::TxnId;
use crate::resource::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Transaction status in the two-phase commit lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnStatus {
    Active,
    Preparing,
    Committed,
    Aborted,
}

/// Why a transaction ended up aborted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    Requested,
    VoteFailed,
    TimedOut,
    ParticipantFailure,
}

/// Final result kept for a transaction after its entry is reclaimed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "outcome", content = "reason")]
pub enum Outcome {
    Committed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub status: TxnStatus,
    pub abort_reason: Option<AbortReason>,
    pub participants: BTreeSet<ResourceKind>,
    /// Participants that still have to receive the phase-two decision
    #[serde(default)]
    pub undelivered: BTreeSet<ResourceKind>,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TxnStatus::Active,
            abort_reason: None,
            participants: BTreeSet::new(),
            undelivered: BTreeSet::new(),
            started_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Milliseconds since the last operation under this transaction
    pub fn idle_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_active).num_milliseconds()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TxnStatus::Committed | TxnStatus::Aborted)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            TxnStatus::Committed => Some(Outcome::Committed),
            TxnStatus::Aborted => Some(Outcome::Aborted(
                self.abort_reason.unwrap_or(AbortReason::Requested),
            )),
            _ => None,
        }
    }
}

pub const JOURNAL_VERSION: u32 = 1;

/// Durable snapshot of the transaction manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub version: u32,
    pub next_id: i64,
    pub transactions: BTreeMap<TxnId, Transaction>,
    #[serde(default)]
    pub outcomes: BTreeMap<TxnId, Outcome>,
}

impl Default for JournalRecord {
    fn default() -> Self {
        Self {
            version: JOURNAL_VERSION,
            next_id: 1,
            transactions: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }
}
