use crate::item::ItemRef;
use crate::metrics::Metrics;
use crate::protocol::{Reply, Request};
use crate::server::Handler;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{error, info, warn};
use wayfare_core::{CoreError, CoreResult, ResourceManager};
use wayfare_shared::{CustomerId, ResourceKind, TxnId};
use wayfare_store::app_config::ItineraryMode;
use wayfare_txn::TransactionManager;

/// The RM that mints customer ids.
pub const PRIMARY: ResourceKind = ResourceKind::Car;

/// One downstream RM and the lock serializing calls to it.
struct Lane {
    rm: Arc<dyn ResourceManager>,
    lock: Mutex<()>,
}

/// Middleware in front of the resource managers.
///
/// Routes single-resource calls to the owning RM, fans customer operations out
/// to every RM and books itineraries. Transaction boundaries go through the
/// transaction manager. Every call made under a transaction takes the lanes of
/// the RMs it touches, then enlists them. A transport failure under a
/// transaction aborts it.
pub struct Coordinator {
    lanes: BTreeMap<ResourceKind, Lane>,
    tm: Arc<TransactionManager>,
    mode: ItineraryMode,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        rms: HashMap<ResourceKind, Arc<dyn ResourceManager>>,
        tm: Arc<TransactionManager>,
        mode: ItineraryMode,
        metrics: Arc<Metrics>,
    ) -> CoreResult<Self> {
        let mut lanes = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let rm = rms
                .get(&kind)
                .cloned()
                .ok_or_else(|| CoreError::Internal(format!("no resource manager configured for {}", kind)))?;
            lanes.insert(
                kind,
                Lane {
                    rm,
                    lock: Mutex::new(()),
                },
            );
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            lanes,
            tm,
            mode,
            metrics,
            shutdown_tx,
        })
    }

    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn mode(&self) -> ItineraryMode {
        self.mode
    }

    /// Flips to true once a shutdown request was accepted.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn rm(&self, kind: ResourceKind) -> CoreResult<&dyn ResourceManager> {
        self.lanes
            .get(&kind)
            .map(|lane| lane.rm.as_ref())
            .ok_or_else(|| CoreError::Internal(format!("no lane for {}", kind)))
    }

    /// Locks the lanes of `kinds` in Flight, Car, Room order.
    async fn hold(&self, kinds: &[ResourceKind]) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(kinds.len());
        for (kind, lane) in &self.lanes {
            if kinds.contains(kind) {
                guards.push(lane.lock.lock().await);
            }
        }
        guards
    }

    async fn enlist(&self, txn: TxnId, kinds: &[ResourceKind]) -> CoreResult<()> {
        if txn.is_global() {
            return Ok(());
        }
        self.tm.enlist(txn, kinds).await
    }

    /// Aborts `txn` when `result` is a transport failure. When the RM already
    /// got a decision for `txn`, the caller sees why the transaction ended.
    async fn settle<T>(&self, txn: TxnId, result: CoreResult<T>) -> CoreResult<T> {
        if txn.is_global() {
            return result;
        }
        match result {
            Err(CoreError::InvalidTransaction(id, reason)) => {
                self.tm.check_active(txn).await?;
                Err(CoreError::InvalidTransaction(id, reason))
            }
            Err(e) if e.is_systemic() => {
                warn!("RM failure under transaction {}: {}. Aborting it", txn, e);
                if let Err(abort_err) = self.tm.abort_on_failure(txn).await {
                    error!("Could not abort transaction {}: {}", txn, abort_err);
                }
                Err(e)
            }
            other => other,
        }
    }

    pub async fn start(&self) -> CoreResult<TxnId> {
        self.tm.start().await
    }

    pub async fn commit(&self, txn: TxnId) -> CoreResult<bool> {
        if txn.is_global() {
            return Err(CoreError::InvalidTransaction(txn, "no transaction to commit".into()));
        }
        self.tm.commit(txn).await
    }

    pub async fn abort(&self, txn: TxnId) -> CoreResult<()> {
        if txn.is_global() {
            return Err(CoreError::InvalidTransaction(txn, "no transaction to abort".into()));
        }
        self.tm.abort(txn).await
    }

    pub async fn add(&self, txn: TxnId, item: &ItemRef, count: i64, price: i64) -> CoreResult<bool> {
        let kind = item.kind();
        let _lane = self.hold(&[kind]).await;
        self.enlist(txn, &[kind]).await?;
        let result = item.add(self.rm(kind)?, txn, count, price).await;
        self.settle(txn, result).await
    }

    pub async fn delete(&self, txn: TxnId, item: &ItemRef) -> CoreResult<bool> {
        let kind = item.kind();
        let _lane = self.hold(&[kind]).await;
        self.enlist(txn, &[kind]).await?;
        let result = item.delete(self.rm(kind)?, txn).await;
        self.settle(txn, result).await
    }

    pub async fn query(&self, txn: TxnId, item: &ItemRef) -> CoreResult<i64> {
        let kind = item.kind();
        let _lane = self.hold(&[kind]).await;
        self.enlist(txn, &[kind]).await?;
        let result = item.query(self.rm(kind)?, txn).await;
        self.settle(txn, result).await
    }

    pub async fn query_price(&self, txn: TxnId, item: &ItemRef) -> CoreResult<i64> {
        let kind = item.kind();
        let _lane = self.hold(&[kind]).await;
        self.enlist(txn, &[kind]).await?;
        let result = item.query_price(self.rm(kind)?, txn).await;
        self.settle(txn, result).await
    }

    pub async fn reserve(&self, txn: TxnId, customer: CustomerId, item: &ItemRef) -> CoreResult<bool> {
        let kind = item.kind();
        let _lane = self.hold(&[kind]).await;
        self.enlist(txn, &[kind]).await?;
        let result = item.reserve(self.rm(kind)?, txn, customer).await;
        self.settle(txn, result).await
    }

    /// Mints a customer id on the primary RM and registers it on the others.
    /// The minted id is returned even if another RM refuses it.
    pub async fn new_customer(&self, txn: TxnId) -> CoreResult<CustomerId> {
        let _lanes = self.hold(&ResourceKind::ALL).await;
        self.enlist(txn, &ResourceKind::ALL).await?;
        let result = self.mint_customer(txn).await;
        self.settle(txn, result).await
    }

    async fn mint_customer(&self, txn: TxnId) -> CoreResult<CustomerId> {
        let customer = self.rm(PRIMARY)?.new_customer(txn).await?;
        for kind in ResourceKind::ALL.into_iter().filter(|kind| *kind != PRIMARY) {
            if !self.rm(kind)?.new_customer_with_id(txn, customer).await? {
                warn!("RM {} refused customer {} minted by RM {}", kind, customer, PRIMARY);
            }
        }
        info!("Customer {} created under transaction {}", customer, txn);
        Ok(customer)
    }

    /// True only if every RM created the customer. Nothing is undone otherwise.
    pub async fn new_customer_with_id(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        let _lanes = self.hold(&ResourceKind::ALL).await;
        self.enlist(txn, &ResourceKind::ALL).await?;
        let mut result = Ok(true);
        for kind in ResourceKind::ALL {
            match self.rm(kind)?.new_customer_with_id(txn, customer).await {
                Ok(created) => result = result.map(|all| all & created),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.settle(txn, result).await
    }

    /// True only if every RM deleted the customer. Nothing is undone otherwise.
    pub async fn delete_customer(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        let _lanes = self.hold(&ResourceKind::ALL).await;
        self.enlist(txn, &ResourceKind::ALL).await?;
        let mut result = Ok(true);
        for kind in ResourceKind::ALL {
            match self.rm(kind)?.delete_customer(txn, customer).await {
                Ok(deleted) => result = result.map(|all| all & deleted),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.settle(txn, result).await
    }

    /// Every RM's part of the bill under its own heading, or `""` when no RM
    /// knows the customer.
    pub async fn query_customer_info(&self, txn: TxnId, customer: CustomerId) -> CoreResult<String> {
        let _lanes = self.hold(&ResourceKind::ALL).await;
        self.enlist(txn, &ResourceKind::ALL).await?;
        let result = self.collect_bills(txn, customer).await;
        self.settle(txn, result).await
    }

    async fn collect_bills(&self, txn: TxnId, customer: CustomerId) -> CoreResult<String> {
        let mut info = String::new();
        let mut known = false;
        for kind in ResourceKind::ALL {
            let bill = self.rm(kind)?.query_customer_info(txn, customer).await?;
            known |= !bill.is_empty();
            info.push_str(&format!("\n{}:\n{}", kind.label(), bill));
        }
        Ok(if known { info } else { String::new() })
    }

    /// Books one seat per flight plus an optional car and room at `location`.
    pub async fn itinerary(
        &self,
        txn: TxnId,
        customer: CustomerId,
        flights: &[i64],
        location: &str,
        car: bool,
        room: bool,
    ) -> CoreResult<bool> {
        let mut kinds = Vec::new();
        if !flights.is_empty() {
            kinds.push(ResourceKind::Flight);
        }
        if car {
            kinds.push(ResourceKind::Car);
        }
        if room {
            kinds.push(ResourceKind::Room);
        }
        let legs = Legs {
            customer,
            flights,
            location,
            car,
            room,
        };

        match self.mode {
            ItineraryMode::BestEffort => {
                let _lanes = self.hold(&kinds).await;
                self.enlist(txn, &kinds).await?;
                let result = self.reserve_legs(txn, &legs, false).await;
                self.settle(txn, result).await
            }
            ItineraryMode::Atomic if txn.is_global() => self.itinerary_in_own_transaction(&kinds, &legs).await,
            ItineraryMode::Atomic => {
                let booked = {
                    let _lanes = self.hold(&kinds).await;
                    self.enlist(txn, &kinds).await?;
                    let result = self.reserve_legs(txn, &legs, true).await;
                    self.settle(txn, result).await?
                };
                if booked {
                    return Ok(true);
                }
                warn!("Itinerary of customer {} failed, aborting transaction {}", customer, txn);
                self.tm.abort(txn).await?;
                Err(CoreError::TransactionAborted(
                    txn,
                    "itinerary leg could not be reserved".into(),
                ))
            }
        }
    }

    async fn itinerary_in_own_transaction(&self, kinds: &[ResourceKind], legs: &Legs<'_>) -> CoreResult<bool> {
        let txn = self.tm.start().await?;
        if let Err(e) = self.tm.enlist(txn, kinds).await {
            if let Err(abort_err) = self.tm.abort(txn).await {
                error!("Could not abort itinerary transaction {}: {}", txn, abort_err);
            }
            return Err(e);
        }
        let booked = {
            let _lanes = self.hold(kinds).await;
            let result = self.reserve_legs(txn, legs, true).await;
            self.settle(txn, result).await?
        };
        if !booked {
            info!("Itinerary of customer {} failed, rolling back transaction {}", legs.customer, txn);
            self.tm.abort(txn).await?;
            return Ok(false);
        }
        match self.tm.commit(txn).await {
            Err(CoreError::TransactionAborted(_, reason)) => {
                warn!("Itinerary transaction {} aborted at commit: {}", txn, reason);
                Ok(false)
            }
            other => other,
        }
    }

    async fn reserve_legs(&self, txn: TxnId, legs: &Legs<'_>, stop_early: bool) -> CoreResult<bool> {
        let mut booked = true;
        for flight in legs.flights {
            booked &= self.rm(ResourceKind::Flight)?.reserve_flight(txn, legs.customer, *flight).await?;
            if stop_early && !booked {
                return Ok(false);
            }
        }
        if legs.car {
            booked &= self.rm(ResourceKind::Car)?.reserve_car(txn, legs.customer, legs.location).await?;
            if stop_early && !booked {
                return Ok(false);
            }
        }
        if legs.room {
            booked &= self.rm(ResourceKind::Room)?.reserve_room(txn, legs.customer, legs.location).await?;
        }
        Ok(booked)
    }

    /// Checks every RM is reachable.
    pub async fn ping(&self) -> CoreResult<()> {
        let pings = self.lanes.iter().map(|(kind, lane)| async move {
            let _lane = lane.lock.lock().await;
            lane.rm
                .ping()
                .await
                .map_err(|e| CoreError::Unavailable(format!("RM {} did not answer: {}", kind, e)))
        });
        join_all(pings).await.into_iter().collect()
    }

    /// Refused while any transaction is live. Otherwise stops every RM, then
    /// the coordinator itself.
    pub async fn shutdown(&self) -> CoreResult<bool> {
        if !self.tm.is_idle().await {
            warn!("Shutdown refused: transactions are still live");
            return Ok(false);
        }
        let _lanes = self.hold(&ResourceKind::ALL).await;
        for (kind, lane) in &self.lanes {
            match lane.rm.shutdown().await {
                Ok(_) => info!("RM {} is shutting down", kind),
                Err(e) => warn!("RM {} did not acknowledge shutdown: {}", kind, e),
            }
        }
        self.shutdown_tx.send_replace(true);
        info!("Coordinator is shutting down");
        Ok(true)
    }

    async fn dispatch(&self, request: Request) -> CoreResult<Reply> {
        let reply = match request {
            Request::Start => Reply::Int(self.start().await?.value()),
            Request::Commit(txn) => Reply::Bool(self.commit(txn).await?),
            Request::Abort(txn) => {
                self.abort(txn).await?;
                Reply::Unit
            }
            Request::Shutdown => Reply::Bool(self.shutdown().await?),
            Request::Ping => {
                self.ping().await?;
                Reply::Unit
            }
            Request::Add { txn, item, count, price } => Reply::Bool(self.add(txn, &item, count, price).await?),
            Request::NewCustomer(txn) => Reply::Int(self.new_customer(txn).await?),
            Request::NewCustomerId { txn, customer } => Reply::Bool(self.new_customer_with_id(txn, customer).await?),
            Request::Delete { txn, item } => Reply::Bool(self.delete(txn, &item).await?),
            Request::DeleteCustomer { txn, customer } => Reply::Bool(self.delete_customer(txn, customer).await?),
            Request::Query { txn, item } => Reply::Int(self.query(txn, &item).await?),
            Request::QueryPrice { txn, item } => Reply::Int(self.query_price(txn, &item).await?),
            Request::QueryCustomerInfo { txn, customer } => Reply::Text(self.query_customer_info(txn, customer).await?),
            Request::Reserve { txn, customer, item } => Reply::Bool(self.reserve(txn, customer, &item).await?),
            Request::Itinerary {
                txn,
                customer,
                flights,
                location,
                car,
                room,
            } => Reply::Bool(self.itinerary(txn, customer, &flights, &location, car, room).await?),
            Request::Prepare(_) => {
                return Err(CoreError::Protocol("prepare is only served by resource managers".into()))
            }
        };
        Ok(reply)
    }
}

struct Legs<'a> {
    customer: CustomerId,
    flights: &'a [i64],
    location: &'a str,
    car: bool,
    room: bool,
}

#[async_trait]
impl Handler for Coordinator {
    async fn handle(&self, request: Request) -> CoreResult<Reply> {
        let op = request.name();
        let result = self.dispatch(request).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics.observe_request(op, status);
        result
    }
}
