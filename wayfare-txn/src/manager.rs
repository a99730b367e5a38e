use crate::registry::{Lookup, Registry};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use wayfare_core::{CoreError, CoreResult, Participant, TxnJournal};
use wayfare_shared::models::{AbortReason, FaultPoint, Outcome, Transaction, TxnStatus};
use wayfare_shared::{ResourceKind, TxnId};

#[derive(Debug, Clone)]
pub struct TxnSettings {
    /// Idle time after which the sweep aborts an active transaction
    pub timeout: Duration,
    pub retained_outcomes: usize,
}

impl Default for TxnSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retained_outcomes: 1024,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TxnStats {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub timed_out: u64,
}

/// Owns the transaction registry and drives two-phase commit against the
/// participant RMs.
///
/// The registry lock is never held while a participant is being called.
/// A transaction in `PREPARING` refuses concurrent commit, abort and new work.
pub struct TransactionManager {
    state: Mutex<Registry>,
    participants: HashMap<ResourceKind, Arc<dyn Participant>>,
    journal: Arc<dyn TxnJournal>,
    settings: TxnSettings,
    counters: Counters,
    armed: Mutex<Option<FaultPoint>>,
    halted: watch::Sender<Option<FaultPoint>>,
}

impl TransactionManager {
    /// Builds a manager from whatever the journal holds.
    ///
    /// Active transactions survive the restart with a fresh idle clock.
    /// Transactions caught mid-vote are presumed aborted; their decision, like
    /// any decision not yet delivered, goes out on the next `redeliver`.
    pub async fn open(
        participants: HashMap<ResourceKind, Arc<dyn Participant>>,
        journal: Arc<dyn TxnJournal>,
        settings: TxnSettings,
    ) -> CoreResult<Self> {
        let mut registry = match journal.load().await? {
            Some(record) => Registry::from_record(record, settings.retained_outcomes),
            None => Registry::new(settings.retained_outcomes),
        };

        let mut presumed = Vec::new();
        for t in registry.transactions_mut() {
            match t.status {
                TxnStatus::Active => t.touch(),
                TxnStatus::Preparing => presumed.push(t.id),
                TxnStatus::Committed | TxnStatus::Aborted => {}
            }
        }
        for id in presumed {
            warn!("Transaction {} was mid-vote when the TM stopped. Presuming abort", id);
            registry.decide(id, Outcome::Aborted(AbortReason::VoteFailed));
        }

        let (halted, _) = watch::channel(None);
        let tm = Self {
            state: Mutex::new(registry),
            participants,
            journal,
            settings,
            counters: Counters::default(),
            armed: Mutex::new(None),
            halted,
        };
        {
            let state = tm.state.lock().await;
            tm.persist(&state).await?;
        }
        Ok(tm)
    }

    /// Arms a one-shot halt at `point` for the next commit that reaches it.
    /// `None` disarms.
    pub async fn arm_fault(&self, point: Option<FaultPoint>) {
        match point {
            Some(point) => warn!("Fault injection armed at {}", point),
            None => info!("Fault injection disarmed"),
        }
        *self.armed.lock().await = point;
    }

    pub async fn armed_fault(&self) -> Option<FaultPoint> {
        *self.armed.lock().await
    }

    /// Becomes `Some(point)` once an armed fault fired. A halted manager
    /// refuses all further work; only a restart from the journal recovers.
    pub fn halt_signal(&self) -> watch::Receiver<Option<FaultPoint>> {
        self.halted.subscribe()
    }

    async fn trip(&self, point: FaultPoint, txn: TxnId) -> CoreResult<()> {
        {
            let mut armed = self.armed.lock().await;
            if *armed != Some(point) {
                return Ok(());
            }
            *armed = None;
        }
        error!("Halting at fault point {} while committing transaction {}", point, txn);
        self.halted.send_replace(Some(point));
        Err(CoreError::Internal(format!("transaction manager halted at {}", point)))
    }

    fn ensure_running(&self) -> CoreResult<()> {
        match *self.halted.borrow() {
            Some(point) => Err(CoreError::Unavailable(format!(
                "transaction manager halted at {}",
                point
            ))),
            None => Ok(()),
        }
    }

    async fn persist(&self, state: &Registry) -> CoreResult<()> {
        self.journal.save(&state.to_record()).await.map_err(|e| {
            error!("Failed to persist transaction journal: {}", e);
            e
        })
    }

    /// Registers a fresh ACTIVE transaction.
    pub async fn start(&self) -> CoreResult<TxnId> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        let id = state.allocate();
        self.persist(&state).await?;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!("Started a new transaction with id: {}", id);
        Ok(id)
    }

    /// Adds RMs to the participant set and refreshes the idle clock.
    pub async fn enlist(&self, txn: TxnId, kinds: &[ResourceKind]) -> CoreResult<()> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        let added = match state.get_mut(txn) {
            Some(t) if t.status == TxnStatus::Active => {
                t.touch();
                kinds.iter().fold(false, |added, kind| t.participants.insert(*kind) | added)
            }
            _ => return Err(state.refusal(txn)),
        };
        if added {
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// `Ok` while `txn` can take new work, otherwise the error a late caller
    /// should see. Does not refresh the idle clock.
    pub async fn check_active(&self, txn: TxnId) -> CoreResult<()> {
        self.ensure_running()?;
        let state = self.state.lock().await;
        match state.get(txn) {
            Some(t) if t.status == TxnStatus::Active => Ok(()),
            _ => Err(state.refusal(txn)),
        }
    }

    /// Two-phase commit. `Ok(true)` once every participant voted yes;
    /// `TransactionAborted` after the transaction was rolled back everywhere.
    pub async fn commit(&self, txn: TxnId) -> CoreResult<bool> {
        self.ensure_running()?;
        let participants = {
            let mut state = self.state.lock().await;
            let participants = match state.lookup(txn) {
                Lookup::Unknown => return Err(state.refusal(txn)),
                Lookup::Finished(outcome) => return report(txn, outcome),
                Lookup::Live(t) => match t.status {
                    TxnStatus::Active => {
                        t.status = TxnStatus::Preparing;
                        t.touch();
                        t.participants.clone()
                    }
                    TxnStatus::Preparing => return Err(state.refusal(txn)),
                    TxnStatus::Committed | TxnStatus::Aborted => {
                        let outcome = t.outcome().unwrap_or(Outcome::Aborted(AbortReason::Requested));
                        return report(txn, outcome);
                    }
                },
            };
            if let Err(e) = self.persist(&state).await {
                // Not journaled, so the vote never started
                if let Some(t) = state.get_mut(txn) {
                    t.status = TxnStatus::Active;
                }
                return Err(e);
            }
            participants
        };
        self.trip(FaultPoint::BeforeVote, txn).await?;

        info!("Commit phase 1 on transaction {}: vote request to {:?}", txn, participants);
        let mut refusal = None;
        for (i, kind) in participants.iter().enumerate() {
            let vote = match self.participants.get(kind) {
                Some(rm) => rm.prepare(txn).await,
                None => Err(CoreError::Unavailable(format!("no route to RM {}", kind))),
            };
            match vote {
                Ok(true) => {
                    info!("RM {} replied with a YES on transaction {}", kind, txn);
                    if i == 0 {
                        self.trip(FaultPoint::AfterFirstVote, txn).await?;
                    }
                }
                Ok(false) => {
                    warn!("RM {} replied with a NO on transaction {}", kind, txn);
                    refusal = Some(format!("RM {} voted to abort", kind));
                    break;
                }
                Err(e) => {
                    warn!("Could not collect vote of RM {} on transaction {}: {}. Counting a NO", kind, txn, e);
                    refusal = Some(format!("RM {} unreachable during vote: {}", kind, e));
                    break;
                }
            }
        }

        self.trip(FaultPoint::AfterVotes, txn).await?;

        info!("Commit phase 2 on transaction {}: sending decision", txn);
        match refusal {
            None => {
                self.conclude(txn, Outcome::Committed).await?;
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                info!("Transaction {} committed", txn);
                Ok(true)
            }
            Some(reason) => {
                self.conclude(txn, Outcome::Aborted(AbortReason::VoteFailed)).await?;
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                warn!("Transaction {} aborted: {}", txn, reason);
                Err(CoreError::TransactionAborted(txn, reason))
            }
        }
    }

    /// Aborts an active transaction on every participant, skipping the vote.
    pub async fn abort(&self, txn: TxnId) -> CoreResult<()> {
        self.abort_with(txn, AbortReason::Requested).await
    }

    /// Aborts after a participant failed mid-operation.
    pub async fn abort_on_failure(&self, txn: TxnId) -> CoreResult<()> {
        self.abort_with(txn, AbortReason::ParticipantFailure).await
    }

    async fn abort_with(&self, txn: TxnId, reason: AbortReason) -> CoreResult<()> {
        self.ensure_running()?;
        {
            let mut state = self.state.lock().await;
            match state.lookup(txn) {
                Lookup::Live(t) if t.status == TxnStatus::Active => {}
                Lookup::Live(t) if t.status == TxnStatus::Aborted && t.abort_reason != Some(AbortReason::TimedOut) => {
                    return Ok(())
                }
                Lookup::Finished(Outcome::Aborted(r)) if r != AbortReason::TimedOut => return Ok(()),
                _ => return Err(state.refusal(txn)),
            }
            state.decide(txn, Outcome::Aborted(reason));
            self.persist(&state).await?;
        }

        info!("Aborting transaction {} ({:?})", txn, reason);
        self.deliver_pending(txn, false).await?;
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records a decision for a PREPARING transaction and delivers it.
    async fn conclude(&self, txn: TxnId, outcome: Outcome) -> CoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.decide(txn, outcome);
            // The decision is final once it is on disk
            self.persist(&state).await?;
        }
        self.trip(FaultPoint::AfterDecision, txn).await?;
        self.deliver_pending(txn, true).await
    }

    /// Sends the recorded decision to every participant still owed it and
    /// reclaims the entry once nobody is left. `faults` enables the
    /// delivery fault points of a commit.
    async fn deliver_pending(&self, txn: TxnId, faults: bool) -> CoreResult<()> {
        let (outcome, pending) = {
            let state = self.state.lock().await;
            match state.get(txn).and_then(|t| t.outcome().map(|o| (o, t.undelivered.clone()))) {
                Some(found) => found,
                None => return Ok(()),
            }
        };

        let delivered = self.deliver(txn, outcome, &pending, faults).await?;
        if faults {
            self.trip(FaultPoint::AfterDelivery, txn).await?;
        }

        let mut state = self.state.lock().await;
        if let Some(t) = state.get_mut(txn) {
            t.undelivered.retain(|kind| !delivered.contains(kind));
            if t.undelivered.is_empty() {
                state.reclaim(txn);
            } else {
                warn!(
                    "Decision on transaction {} still owed to {:?}. Will retry",
                    txn, t.undelivered
                );
            }
        }
        self.persist(&state).await
    }

    async fn deliver(
        &self,
        txn: TxnId,
        outcome: Outcome,
        kinds: &BTreeSet<ResourceKind>,
        faults: bool,
    ) -> CoreResult<BTreeSet<ResourceKind>> {
        let mut delivered = BTreeSet::new();
        for kind in kinds {
            let Some(rm) = self.participants.get(kind) else {
                warn!("No route to RM {} for transaction {}", kind, txn);
                continue;
            };
            let result = match outcome {
                Outcome::Committed => rm.commit(txn).await.map(|_| ()),
                Outcome::Aborted(_) => rm.abort(txn).await,
            };
            match result {
                Ok(()) => {
                    delivered.insert(*kind);
                }
                Err(CoreError::InvalidTransaction(..)) => {
                    // Nothing left to apply on that RM
                    warn!("RM {} no longer knows transaction {}", kind, txn);
                    delivered.insert(*kind);
                }
                Err(e) => warn!("Could not deliver {:?} on transaction {} to RM {}: {}", outcome, txn, kind, e),
            }
            if faults && delivered.len() == 1 {
                self.trip(FaultPoint::AfterFirstDelivery, txn).await?;
            }
        }
        Ok(delivered)
    }

    /// Aborts every ACTIVE transaction idle for longer than the timeout.
    pub async fn sweep_expired(&self) -> CoreResult<Vec<TxnId>> {
        self.ensure_running()?;
        let expired: Vec<TxnId> = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let limit = self.settings.timeout.as_millis() as i64;
            let expired: Vec<TxnId> = state
                .transactions()
                .filter(|t| t.status == TxnStatus::Active && t.idle_millis(now) > limit)
                .map(|t| t.id)
                .collect();
            if expired.is_empty() {
                return Ok(expired);
            }
            for id in &expired {
                state.decide(*id, Outcome::Aborted(AbortReason::TimedOut));
            }
            self.persist(&state).await?;
            expired
        };

        for id in &expired {
            warn!("Transaction {} exceeded its liveness window. Aborting", id);
            self.deliver_pending(*id, false).await?;
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(expired)
    }

    /// Retries every decision still owed to a participant.
    /// Returns how many transactions were fully settled.
    pub async fn redeliver(&self) -> CoreResult<usize> {
        self.ensure_running()?;
        let pending: Vec<TxnId> = {
            let state = self.state.lock().await;
            state.transactions().filter(|t| t.is_terminal()).map(|t| t.id).collect()
        };

        let mut settled = 0;
        for id in pending {
            self.deliver_pending(id, false).await?;
            if self.state.lock().await.get(id).is_none() {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Reclaims the bookkeeping entry of a terminal transaction.
    pub async fn remove_transaction(&self, txn: TxnId) -> CoreResult<Outcome> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        match state.get(txn) {
            Some(t) if t.is_terminal() => {}
            _ => return Err(CoreError::InvalidTransaction(txn, "transaction is not finished".into())),
        }
        let outcome = state
            .reclaim(txn)
            .ok_or_else(|| CoreError::Internal(format!("transaction {} has no outcome", txn)))?;
        self.persist(&state).await?;
        Ok(outcome)
    }

    /// Snapshot of every transaction still in the registry.
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().await.transactions().cloned().collect()
    }

    pub async fn transaction(&self, txn: TxnId) -> Option<Transaction> {
        self.state.lock().await.get(txn).cloned()
    }

    pub async fn outcome(&self, txn: TxnId) -> Option<Outcome> {
        let state = self.state.lock().await;
        state.get(txn).and_then(Transaction::outcome).or_else(|| state.outcome(txn))
    }

    /// True when no transaction is live or waiting for redelivery.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.transactions().next().is_none()
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            started: self.counters.started.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}

fn report(txn: TxnId, outcome: Outcome) -> CoreResult<bool> {
    match outcome {
        Outcome::Committed => Ok(true),
        Outcome::Aborted(AbortReason::TimedOut) => Err(CoreError::TransactionTimedOut(txn)),
        Outcome::Aborted(reason) => Err(CoreError::TransactionAborted(txn, format!("already aborted ({:?})", reason))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use wayfare_catalog::InventoryManager;
    use wayfare_core::ResourceManager;
    use wayfare_store::{FileJournal, MemoryJournal};

    /// Participant that can be switched off to play an unreachable RM.
    struct Flaky {
        inner: Arc<InventoryManager>,
        down: AtomicBool,
    }

    impl Flaky {
        fn new(kind: ResourceKind) -> Arc<Self> {
            Arc::new(Self {
                inner: Arc::new(InventoryManager::new(kind.as_str(), kind)),
                down: AtomicBool::new(false),
            })
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> CoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(CoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Participant for Flaky {
        async fn prepare(&self, txn: TxnId) -> CoreResult<bool> {
            self.check()?;
            self.inner.prepare(txn).await
        }

        async fn commit(&self, txn: TxnId) -> CoreResult<bool> {
            self.check()?;
            self.inner.commit(txn).await
        }

        async fn abort(&self, txn: TxnId) -> CoreResult<()> {
            self.check()?;
            self.inner.abort(txn).await
        }
    }

    struct Fixture {
        tm: TransactionManager,
        flight: Arc<Flaky>,
        car: Arc<Flaky>,
        journal: Arc<MemoryJournal>,
    }

    async fn fixture(settings: TxnSettings) -> Fixture {
        let flight = Flaky::new(ResourceKind::Flight);
        let car = Flaky::new(ResourceKind::Car);
        let journal = Arc::new(MemoryJournal::new());
        let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
        participants.insert(ResourceKind::Flight, flight.clone());
        participants.insert(ResourceKind::Car, car.clone());
        let tm = TransactionManager::open(participants, journal.clone(), settings).await.unwrap();
        Fixture { tm, flight, car, journal }
    }

    #[tokio::test]
    async fn test_commit_merges_every_participant() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Flight, ResourceKind::Car]).await.unwrap();
        f.flight.inner.add_flight(txn, 100, 5, 20).await.unwrap();
        f.car.inner.add_cars(txn, "paris", 3, 40).await.unwrap();

        assert!(f.tm.commit(txn).await.unwrap());
        assert_eq!(f.flight.inner.query_flight(TxnId::GLOBAL, 100).await.unwrap(), 5);
        assert_eq!(f.car.inner.query_cars(TxnId::GLOBAL, "paris").await.unwrap(), 3);
        assert!(f.flight.inner.active_transactions().await.is_empty());
        assert!(f.tm.is_idle().await);
        assert_eq!(f.tm.outcome(txn).await, Some(Outcome::Committed));
        assert_eq!(f.tm.stats().committed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_participant_aborts_everywhere() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Flight, ResourceKind::Car]).await.unwrap();
        f.flight.inner.add_flight(txn, 1, 5, 20).await.unwrap();
        f.car.inner.add_cars(txn, "rome", 2, 30).await.unwrap();
        f.car.set_down(true);

        let err = f.tm.commit(txn).await.unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted(id, _) if id == txn));

        // Reachable participant rolled back, nothing merged
        assert!(f.flight.inner.active_transactions().await.is_empty());
        assert_eq!(f.flight.inner.query_flight(TxnId::GLOBAL, 1).await.unwrap(), 0);

        // The unreachable one is owed the abort until it comes back
        let pending = f.tm.transaction(txn).await.unwrap();
        assert_eq!(pending.status, TxnStatus::Aborted);
        assert!(pending.undelivered.contains(&ResourceKind::Car));
        assert!(!f.tm.is_idle().await);

        f.car.set_down(false);
        assert_eq!(f.tm.redeliver().await.unwrap(), 1);
        assert!(f.car.inner.active_transactions().await.is_empty());
        assert_eq!(f.car.inner.query_cars(TxnId::GLOBAL, "rome").await.unwrap(), 0);
        assert!(f.tm.is_idle().await);
    }

    #[tokio::test]
    async fn test_no_vote_aborts() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Flight]).await.unwrap();
        // Enlisted but the RM never saw the transaction, so it votes NO

        assert!(matches!(f.tm.commit(txn).await, Err(CoreError::TransactionAborted(..))));
        assert_eq!(f.tm.outcome(txn).await, Some(Outcome::Aborted(AbortReason::VoteFailed)));
    }

    #[tokio::test]
    async fn test_repeated_commit_reports_prior_outcome() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Flight]).await.unwrap();
        f.flight.inner.add_flight(txn, 3, 1, 10).await.unwrap();
        assert!(f.tm.commit(txn).await.unwrap());

        assert!(f.tm.commit(txn).await.unwrap());
        assert_eq!(f.flight.inner.query_flight(TxnId::GLOBAL, 3).await.unwrap(), 1);

        assert!(matches!(f.tm.abort(txn).await, Err(CoreError::InvalidTransaction(..))));
        assert!(matches!(
            f.tm.enlist(txn, &[ResourceKind::Car]).await,
            Err(CoreError::InvalidTransaction(..))
        ));
    }

    #[tokio::test]
    async fn test_abort_discards_and_is_idempotent() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Car]).await.unwrap();
        f.car.inner.add_cars(txn, "oslo", 4, 70).await.unwrap();

        f.tm.abort(txn).await.unwrap();
        assert_eq!(f.car.inner.query_cars(TxnId::GLOBAL, "oslo").await.unwrap(), 0);
        f.tm.abort(txn).await.unwrap();
        assert!(matches!(f.tm.commit(txn).await, Err(CoreError::TransactionAborted(..))));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_invalid() {
        let f = fixture(TxnSettings::default()).await;
        assert!(matches!(f.tm.commit(TxnId(42)).await, Err(CoreError::InvalidTransaction(..))));
        assert!(matches!(f.tm.abort(TxnId(42)).await, Err(CoreError::InvalidTransaction(..))));
        assert!(matches!(
            f.tm.enlist(TxnId(42), &[ResourceKind::Flight]).await,
            Err(CoreError::InvalidTransaction(..))
        ));
    }

    #[tokio::test]
    async fn test_sweep_times_out_idle_transactions() {
        let f = fixture(TxnSettings {
            timeout: Duration::from_millis(20),
            retained_outcomes: 16,
        })
        .await;
        let idle = f.tm.start().await.unwrap();
        f.tm.enlist(idle, &[ResourceKind::Flight]).await.unwrap();
        f.flight.inner.add_flight(idle, 8, 2, 10).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let busy = f.tm.start().await.unwrap();

        let expired = f.tm.sweep_expired().await.unwrap();
        assert_eq!(expired, vec![idle]);
        assert!(f.flight.inner.active_transactions().await.is_empty());

        assert_eq!(f.tm.commit(idle).await, Err(CoreError::TransactionTimedOut(idle)));
        assert_eq!(
            f.tm.enlist(idle, &[ResourceKind::Flight]).await,
            Err(CoreError::TransactionTimedOut(idle))
        );
        assert!(f.tm.transaction(busy).await.is_some());
        assert_eq!(f.tm.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_state_transitions_are_journaled() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        f.tm.enlist(txn, &[ResourceKind::Flight]).await.unwrap();

        let record = f.journal.snapshot().await.unwrap();
        assert_eq!(record.next_id, txn.value() + 1);
        assert!(record.transactions[&txn].participants.contains(&ResourceKind::Flight));

        f.tm.abort(txn).await.unwrap();
        let record = f.journal.snapshot().await.unwrap();
        assert!(record.transactions.is_empty());
        assert_eq!(record.outcomes[&txn], Outcome::Aborted(AbortReason::Requested));
    }

    #[tokio::test]
    async fn test_restart_restores_ids_and_presumes_abort_mid_vote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tm.json");
        let flight = Flaky::new(ResourceKind::Flight);
        let participants = || {
            let mut map: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
            map.insert(ResourceKind::Flight, flight.clone());
            map
        };

        let (live, voting) = {
            let tm = TransactionManager::open(participants(), Arc::new(FileJournal::new(&path)), TxnSettings::default())
                .await
                .unwrap();
            let live = tm.start().await.unwrap();
            let voting = tm.start().await.unwrap();
            tm.enlist(voting, &[ResourceKind::Flight]).await.unwrap();
            flight.inner.add_flight(voting, 1, 1, 1).await.unwrap();
            // Simulate a crash between phase one and the decision
            tm.state.lock().await.get_mut(voting).unwrap().status = TxnStatus::Preparing;
            let state = tm.state.lock().await;
            tm.persist(&state).await.unwrap();
            (live, voting)
        };

        let tm = TransactionManager::open(participants(), Arc::new(FileJournal::new(&path)), TxnSettings::default())
            .await
            .unwrap();
        assert_eq!(tm.transaction(live).await.unwrap().status, TxnStatus::Active);
        assert_eq!(tm.transaction(voting).await.unwrap().status, TxnStatus::Aborted);

        tm.redeliver().await.unwrap();
        assert!(flight.inner.active_transactions().await.is_empty());
        assert_eq!(tm.outcome(voting).await, Some(Outcome::Aborted(AbortReason::VoteFailed)));

        let next = tm.start().await.unwrap();
        assert_eq!(next, TxnId(voting.value() + 1));
    }

    #[tokio::test]
    async fn test_remove_transaction_requires_terminal_state() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        assert!(f.tm.remove_transaction(txn).await.is_err());

        f.tm.enlist(txn, &[ResourceKind::Car]).await.unwrap();
        f.car.inner.add_cars(txn, "nice", 1, 1).await.unwrap();
        f.car.set_down(true);
        f.tm.abort(txn).await.unwrap();

        // Abort is owed to the car RM, the operator gives up on it
        assert_eq!(f.tm.remove_transaction(txn).await.unwrap(), Outcome::Aborted(AbortReason::Requested));
        assert!(f.tm.is_idle().await);
    }

    /// Journal whose next save can be made to fail.
    struct FailingJournal {
        inner: MemoryJournal,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl TxnJournal for FailingJournal {
        async fn load(&self) -> CoreResult<Option<wayfare_shared::models::JournalRecord>> {
            self.inner.load().await
        }

        async fn save(&self, record: &wayfare_shared::models::JournalRecord) -> CoreResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Journal("disk full".into()));
            }
            self.inner.save(record).await
        }
    }

    #[tokio::test]
    async fn test_failed_prepare_write_keeps_transaction_usable() {
        let flight = Flaky::new(ResourceKind::Flight);
        let journal = Arc::new(FailingJournal {
            inner: MemoryJournal::new(),
            fail_next: AtomicBool::new(false),
        });
        let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
        participants.insert(ResourceKind::Flight, flight.clone());
        let tm = TransactionManager::open(participants, journal.clone(), TxnSettings::default())
            .await
            .unwrap();

        let txn = tm.start().await.unwrap();
        tm.enlist(txn, &[ResourceKind::Flight]).await.unwrap();
        flight.inner.add_flight(txn, 4, 2, 50).await.unwrap();

        journal.fail_next.store(true, Ordering::SeqCst);
        assert_eq!(tm.commit(txn).await, Err(CoreError::Journal("disk full".into())));
        assert_eq!(tm.transaction(txn).await.unwrap().status, TxnStatus::Active);

        // The transaction can still finish either way
        assert!(tm.commit(txn).await.unwrap());
        assert_eq!(flight.inner.query_flight(TxnId::GLOBAL, 4).await.unwrap(), 2);
        assert!(tm.is_idle().await);
    }

    #[tokio::test]
    async fn test_failed_prepare_write_can_still_be_swept() {
        let journal = Arc::new(FailingJournal {
            inner: MemoryJournal::new(),
            fail_next: AtomicBool::new(false),
        });
        let settings = TxnSettings {
            timeout: Duration::from_millis(10),
            retained_outcomes: 16,
        };
        let tm = TransactionManager::open(HashMap::new(), journal.clone(), settings).await.unwrap();
        let txn = tm.start().await.unwrap();

        journal.fail_next.store(true, Ordering::SeqCst);
        assert!(tm.commit(txn).await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tm.sweep_expired().await.unwrap(), vec![txn]);
        assert!(tm.is_idle().await);
    }

    async fn reopen(f: &Fixture) -> TransactionManager {
        let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
        participants.insert(ResourceKind::Flight, f.flight.clone());
        participants.insert(ResourceKind::Car, f.car.clone());
        TransactionManager::open(participants, f.journal.clone(), TxnSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_restart_recovers_from_every_fault_point() {
        for point in FaultPoint::ALL {
            let f = fixture(TxnSettings::default()).await;
            let txn = f.tm.start().await.unwrap();
            f.tm.enlist(txn, &[ResourceKind::Flight, ResourceKind::Car]).await.unwrap();
            f.flight.inner.add_flight(txn, 10, 3, 100).await.unwrap();
            f.car.inner.add_cars(txn, "lima", 2, 60).await.unwrap();

            f.tm.arm_fault(Some(point)).await;
            assert!(
                matches!(f.tm.commit(txn).await, Err(CoreError::Internal(_))),
                "{} did not halt the commit",
                point
            );
            assert_eq!(*f.tm.halt_signal().borrow(), Some(point));
            assert!(matches!(f.tm.start().await, Err(CoreError::Unavailable(_))));

            let tm = reopen(&f).await;
            assert_eq!(tm.redeliver().await.unwrap(), 1, "{} left work behind", point);
            assert!(tm.is_idle().await);
            assert!(f.flight.inner.active_transactions().await.is_empty());
            assert!(f.car.inner.active_transactions().await.is_empty());

            let (seats, cars) = if point.is_decided() { (3, 2) } else { (0, 0) };
            assert_eq!(f.flight.inner.query_flight(TxnId::GLOBAL, 10).await.unwrap(), seats, "{}", point);
            assert_eq!(f.car.inner.query_cars(TxnId::GLOBAL, "lima").await.unwrap(), cars, "{}", point);
            let expected = if point.is_decided() {
                Outcome::Committed
            } else {
                Outcome::Aborted(AbortReason::VoteFailed)
            };
            assert_eq!(tm.outcome(txn).await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_armed_fault_is_one_shot_and_can_be_disarmed() {
        let f = fixture(TxnSettings::default()).await;
        f.tm.arm_fault(Some(FaultPoint::AfterVotes)).await;
        assert_eq!(f.tm.armed_fault().await, Some(FaultPoint::AfterVotes));
        f.tm.arm_fault(None).await;

        let txn = f.tm.start().await.unwrap();
        assert!(f.tm.commit(txn).await.unwrap());
        assert!(f.tm.halt_signal().borrow().is_none());
    }

    #[tokio::test]
    async fn test_empty_transaction_commits() {
        let f = fixture(TxnSettings::default()).await;
        let txn = f.tm.start().await.unwrap();
        assert!(f.tm.commit(txn).await.unwrap());
    }
}
