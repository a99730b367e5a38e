use std::collections::{BTreeMap, BTreeSet};
use wayfare_core::CoreError;
use wayfare_shared::models::{AbortReason, JournalRecord, Outcome, Transaction, TxnStatus, JOURNAL_VERSION};
use wayfare_shared::{ResourceKind, TxnId};

/// In-memory bookkeeping of the transaction manager. Everything in here is
/// what gets written to the journal.
#[derive(Debug)]
pub struct Registry {
    next_id: i64,
    transactions: BTreeMap<TxnId, Transaction>,
    outcomes: BTreeMap<TxnId, Outcome>,
    retained_outcomes: usize,
}

/// Where a transaction id stands
pub enum Lookup<'a> {
    Live(&'a mut Transaction),
    Finished(Outcome),
    Unknown,
}

impl Registry {
    pub fn new(retained_outcomes: usize) -> Self {
        Self::from_record(JournalRecord::default(), retained_outcomes)
    }

    pub fn from_record(record: JournalRecord, retained_outcomes: usize) -> Self {
        Self {
            next_id: record.next_id.max(1),
            transactions: record.transactions,
            outcomes: record.outcomes,
            retained_outcomes,
        }
    }

    pub fn to_record(&self) -> JournalRecord {
        JournalRecord {
            version: JOURNAL_VERSION,
            next_id: self.next_id,
            transactions: self.transactions.clone(),
            outcomes: self.outcomes.clone(),
        }
    }

    pub fn allocate(&mut self) -> TxnId {
        let id = TxnId(self.next_id);
        self.next_id += 1;
        self.transactions.insert(id, Transaction::new(id));
        id
    }

    pub fn lookup(&mut self, txn: TxnId) -> Lookup<'_> {
        if let Some(t) = self.transactions.get_mut(&txn) {
            return Lookup::Live(t);
        }
        match self.outcomes.get(&txn) {
            Some(outcome) => Lookup::Finished(*outcome),
            None => Lookup::Unknown,
        }
    }

    pub fn get(&self, txn: TxnId) -> Option<&Transaction> {
        self.transactions.get(&txn)
    }

    pub fn get_mut(&mut self, txn: TxnId) -> Option<&mut Transaction> {
        self.transactions.get_mut(&txn)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn transactions_mut(&mut self) -> impl Iterator<Item = &mut Transaction> {
        self.transactions.values_mut()
    }

    pub fn outcome(&self, txn: TxnId) -> Option<Outcome> {
        self.outcomes.get(&txn).copied()
    }

    /// Records the final decision and returns the participants that must hear it.
    pub fn decide(&mut self, txn: TxnId, outcome: Outcome) -> Option<BTreeSet<ResourceKind>> {
        let t = self.transactions.get_mut(&txn)?;
        match outcome {
            Outcome::Committed => {
                t.status = TxnStatus::Committed;
                t.abort_reason = None;
            }
            Outcome::Aborted(reason) => {
                t.status = TxnStatus::Aborted;
                t.abort_reason = Some(reason);
            }
        }
        t.undelivered = t.participants.clone();
        t.touch();
        Some(t.participants.clone())
    }

    /// Moves a terminal transaction into the outcome history.
    pub fn reclaim(&mut self, txn: TxnId) -> Option<Outcome> {
        let outcome = self.transactions.get(&txn)?.outcome()?;
        self.transactions.remove(&txn);
        self.outcomes.insert(txn, outcome);
        while self.outcomes.len() > self.retained_outcomes {
            self.outcomes.pop_first();
        }
        Some(outcome)
    }

    /// The error a caller gets for an id that cannot take new work.
    pub fn refusal(&self, txn: TxnId) -> CoreError {
        let outcome = match self.transactions.get(&txn) {
            Some(t) if t.status == TxnStatus::Preparing => {
                return CoreError::InvalidTransaction(txn, "commit in progress".into())
            }
            Some(t) => t.outcome(),
            None => self.outcomes.get(&txn).copied(),
        };
        match outcome {
            Some(Outcome::Aborted(AbortReason::TimedOut)) => CoreError::TransactionTimedOut(txn),
            Some(Outcome::Aborted(_)) => CoreError::InvalidTransaction(txn, "transaction already aborted".into()),
            Some(Outcome::Committed) => CoreError::InvalidTransaction(txn, "transaction already committed".into()),
            None => CoreError::InvalidTransaction(txn, "unknown transaction".into()),
        }
    }
}
