use crate::customer::Customer;
use crate::inventory::{InventoryError, InventoryTable, Record, ShadowTable};
use crate::item::{ItemKey, ReservableItem};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{info, warn};
use wayfare_core::{CoreError, CoreResult, Participant, ResourceManager};
use wayfare_shared::{CustomerId, ResourceKind, TxnId};

const MINT_ATTEMPTS: usize = 16;
/// How many finished transaction ids an RM remembers.
const FINISHED_RETAINED: usize = 4096;

/// Resource manager for one category, backed by an in-memory table.
///
/// Transactions never touch the committed table directly: each transaction id
/// gets its own shadow table on first access, and the shadow is merged into
/// the committed table only by `commit`. `TxnId::GLOBAL` bypasses shadows.
pub struct InventoryManager {
    name: String,
    kind: ResourceKind,
    global: Mutex<InventoryTable>,
    shadows: Mutex<Shadows>,
    shutdown_tx: watch::Sender<bool>,
}

/// Live shadow tables plus the ids that already got their decision.
/// A finished id never gets a new shadow.
#[derive(Default)]
struct Shadows {
    live: HashMap<TxnId, Arc<Mutex<ShadowTable>>>,
    finished: HashSet<TxnId>,
    finished_order: VecDeque<TxnId>,
}

impl Shadows {
    fn finish(&mut self, txn: TxnId) -> Option<Arc<Mutex<ShadowTable>>> {
        if self.finished.insert(txn) {
            self.finished_order.push_back(txn);
            if self.finished_order.len() > FINISHED_RETAINED {
                if let Some(oldest) = self.finished_order.pop_front() {
                    self.finished.remove(&oldest);
                }
            }
        }
        self.live.remove(&txn)
    }
}

/// The table a single operation runs against, locked for that operation.
enum View<'a> {
    Global(MutexGuard<'a, InventoryTable>),
    Shadow {
        txn: TxnId,
        shadow: OwnedMutexGuard<ShadowTable>,
        global: &'a Mutex<InventoryTable>,
    },
}

impl View<'_> {
    async fn read(&mut self, key: &ItemKey) -> Option<Record> {
        match self {
            View::Global(table) => table.get(key).cloned(),
            View::Shadow { shadow, global, .. } => {
                if let Some(entry) = shadow.get(key) {
                    return entry.clone();
                }
                let copy = global.lock().await.get(key).cloned();
                if let Some(record) = &copy {
                    shadow.stage(key.clone(), Some(record.clone()));
                }
                copy
            }
        }
    }

    async fn read_item(&mut self, key: &ItemKey) -> Result<Option<ReservableItem>, InventoryError> {
        self.read(key).await.map(Record::into_item).transpose()
    }

    async fn read_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, InventoryError> {
        self.read(&ItemKey::customer(id)).await.map(Record::into_customer).transpose()
    }

    fn write(&mut self, record: Record) {
        match self {
            View::Global(table) => table.put(record),
            View::Shadow { shadow, .. } => shadow.stage(record.key(), Some(record)),
        }
    }

    fn remove(&mut self, key: &ItemKey) {
        match self {
            View::Global(table) => {
                table.remove(key);
            }
            View::Shadow { shadow, .. } => shadow.stage(key.clone(), None),
        }
    }

    fn txn(&self) -> TxnId {
        match self {
            View::Global(_) => TxnId::GLOBAL,
            View::Shadow { txn, .. } => *txn,
        }
    }
}

impl InventoryManager {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            kind,
            global: Mutex::new(InventoryTable::new()),
            shadows: Mutex::new(Shadows::default()),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Resolves once `shutdown` has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Transaction ids that currently own a shadow table.
    pub async fn active_transactions(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.shadows.lock().await.live.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn committed_len(&self) -> usize {
        self.global.lock().await.len()
    }

    async fn view(&self, txn: TxnId) -> CoreResult<View<'_>> {
        if txn.is_global() {
            return Ok(View::Global(self.global.lock().await));
        }

        let shadow = {
            let mut shadows = self.shadows.lock().await;
            if shadows.finished.contains(&txn) {
                warn!("RM[{}] refused work on finished transaction {}", self.name, txn);
                return Err(CoreError::InvalidTransaction(
                    txn,
                    format!("transaction already finished at RM {}", self.name),
                ));
            }
            shadows
                .live
                .entry(txn)
                .or_insert_with(|| {
                    info!("RM[{}] opened shadow table for transaction {}", self.name, txn);
                    Arc::new(Mutex::new(ShadowTable::new()))
                })
                .clone()
        };

        let shadow = shadow.lock_owned().await;
        if shadow.is_closed() {
            return Err(CoreError::InvalidTransaction(
                txn,
                format!("transaction already finished at RM {}", self.name),
            ));
        }
        Ok(View::Shadow { txn, shadow, global: &self.global })
    }

    async fn take_shadow(&self, txn: TxnId) -> Option<ShadowTable> {
        let shadow = self.shadows.lock().await.finish(txn)?;
        let mut guard = shadow.lock().await;
        Some(guard.close())
    }

    async fn add_item(&self, txn: TxnId, key: ItemKey, location: &str, count: i64, price: i64) -> CoreResult<bool> {
        info!("RM[{}]::add({}, {}, count={}, ${}) called", self.name, txn, key, count, price);
        let mut view = self.view(txn).await?;
        match view.read_item(&key).await? {
            None => {
                let item = ReservableItem::new(self.kind, key.clone(), location, count, price);
                view.write(Record::Item(item));
                info!("RM[{}]::add({}) created {}, count={}, price=${}", self.name, txn, key, count, price);
            }
            Some(mut item) => {
                if !item.restock(count, price) {
                    warn!(
                        "RM[{}]::add({}, {}) refused--count {} would overflow the inventory of {}",
                        self.name, txn, key, count, item.total()
                    );
                    return Ok(false);
                }
                info!(
                    "RM[{}]::add({}) modified {}, count={}, price=${}",
                    self.name, txn, key, item.available, item.price
                );
                view.write(Record::Item(item));
            }
        }
        Ok(true)
    }

    async fn delete_item(&self, txn: TxnId, key: ItemKey) -> CoreResult<bool> {
        info!("RM[{}]::delete({}, {}) called", self.name, txn, key);
        let mut view = self.view(txn).await?;
        let Some(item) = view.read_item(&key).await? else {
            warn!("RM[{}]::delete({}, {}) failed--item doesn't exist", self.name, txn, key);
            return Ok(false);
        };

        if !item.is_deletable() {
            info!(
                "RM[{}]::delete({}, {}) refused--{} units still reserved",
                self.name, txn, key, item.reserved
            );
            return Ok(false);
        }

        view.remove(&key);
        info!("RM[{}]::delete({}, {}) item deleted", self.name, txn, key);
        Ok(true)
    }

    async fn query_count(&self, txn: TxnId, key: ItemKey) -> CoreResult<i64> {
        let mut view = self.view(txn).await?;
        let value = view.read_item(&key).await?.map(|i| i.available).unwrap_or(0);
        info!("RM[{}]::queryNum({}, {}) returns count={}", self.name, txn, key, value);
        Ok(value)
    }

    async fn query_price(&self, txn: TxnId, key: ItemKey) -> CoreResult<i64> {
        let mut view = self.view(txn).await?;
        let value = view.read_item(&key).await?.map(|i| i.price).unwrap_or(0);
        info!("RM[{}]::queryPrice({}, {}) returns cost=${}", self.name, txn, key, value);
        Ok(value)
    }

    async fn reserve_item(&self, txn: TxnId, customer: CustomerId, key: ItemKey, location: &str) -> CoreResult<bool> {
        info!("RM[{}]::reserve({}, customer={}, {}) called", self.name, txn, customer, key);
        let mut view = self.view(txn).await?;

        let Some(mut cust) = view.read_customer(customer).await? else {
            warn!("RM[{}]::reserve({}, {}, {}) failed--customer doesn't exist", self.name, txn, customer, key);
            return Ok(false);
        };

        let Some(mut item) = view.read_item(&key).await? else {
            warn!("RM[{}]::reserve({}, {}, {}) failed--item doesn't exist", self.name, txn, customer, key);
            return Ok(false);
        };

        if !item.reserve_one() {
            warn!("RM[{}]::reserve({}, {}, {}) failed--no more items", self.name, txn, customer, key);
            return Ok(false);
        }

        cust.reserve(&key, location, item.price);
        view.write(Record::Customer(cust));
        view.write(Record::Item(item));
        info!("RM[{}]::reserve({}, {}, {}) succeeded", self.name, txn, customer, key);
        Ok(true)
    }
}

fn mint_customer_id(txn: TxnId) -> CustomerId {
    let millis = i64::from(Utc::now().timestamp_subsec_millis());
    let salt: i64 = rand::thread_rng().gen_range(1..=999);
    txn.value()
        .saturating_abs()
        .saturating_mul(1_000_000)
        .saturating_add(millis * 1_000)
        .saturating_add(salt)
}

#[async_trait]
impl Participant for InventoryManager {
    async fn prepare(&self, txn: TxnId) -> CoreResult<bool> {
        let shadow = self.shadows.lock().await.live.get(&txn).cloned();
        let vote = match shadow {
            Some(shadow) => {
                let guard = shadow.lock().await;
                !guard.is_closed()
            }
            None => false,
        };
        info!("RM[{}] votes {} on transaction {}", self.name, if vote { "YES" } else { "NO" }, txn);
        Ok(vote)
    }

    async fn commit(&self, txn: TxnId) -> CoreResult<bool> {
        let Some(shadow) = self.take_shadow(txn).await else {
            warn!("RM[{}] asked to commit unknown transaction {}", self.name, txn);
            return Err(CoreError::InvalidTransaction(
                txn,
                format!("no shadow table at RM {}", self.name),
            ));
        };

        let applied = self.global.lock().await.merge(shadow);
        info!("RM[{}] committed transaction {} ({} entries merged)", self.name, txn, applied);
        Ok(true)
    }

    async fn abort(&self, txn: TxnId) -> CoreResult<()> {
        match self.take_shadow(txn).await {
            Some(shadow) => info!(
                "RM[{}] aborted transaction {} ({} staged entries dropped)",
                self.name,
                txn,
                shadow.len()
            ),
            None => info!("RM[{}] abort of transaction {} had nothing to discard", self.name, txn),
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceManager for InventoryManager {
    async fn add_flight(&self, txn: TxnId, flight_num: i64, seats: i64, price: i64) -> CoreResult<bool> {
        self.add_item(txn, ItemKey::flight(flight_num), &flight_num.to_string(), seats, price).await
    }

    async fn add_cars(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool> {
        self.add_item(txn, ItemKey::car(location), location, count, price).await
    }

    async fn add_rooms(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool> {
        self.add_item(txn, ItemKey::room(location), location, count, price).await
    }

    async fn new_customer(&self, txn: TxnId) -> CoreResult<CustomerId> {
        info!("RM[{}]::newCustomer({}) called", self.name, txn);
        let mut view = self.view(txn).await?;
        for _ in 0..MINT_ATTEMPTS {
            let cid = mint_customer_id(view.txn());
            if view.read_customer(cid).await?.is_none() {
                view.write(Record::Customer(Customer::new(cid)));
                info!("RM[{}]::newCustomer({}) returns ID={}", self.name, txn, cid);
                return Ok(cid);
            }
        }
        Err(InventoryError::CustomerIdExhausted(MINT_ATTEMPTS).into())
    }

    async fn new_customer_with_id(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        info!("RM[{}]::newCustomer({}, {}) called", self.name, txn, customer);
        let mut view = self.view(txn).await?;
        if view.read_customer(customer).await?.is_some() {
            info!("RM[{}]::newCustomer({}, {}) failed--customer already exists", self.name, txn, customer);
            return Ok(false);
        }
        view.write(Record::Customer(Customer::new(customer)));
        Ok(true)
    }

    async fn delete_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<bool> {
        self.delete_item(txn, ItemKey::flight(flight_num)).await
    }

    async fn delete_cars(&self, txn: TxnId, location: &str) -> CoreResult<bool> {
        self.delete_item(txn, ItemKey::car(location)).await
    }

    async fn delete_rooms(&self, txn: TxnId, location: &str) -> CoreResult<bool> {
        self.delete_item(txn, ItemKey::room(location)).await
    }

    async fn delete_customer(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        info!("RM[{}]::deleteCustomer({}, {}) called", self.name, txn, customer);
        let mut view = self.view(txn).await?;
        let Some(cust) = view.read_customer(customer).await? else {
            warn!("RM[{}]::deleteCustomer({}, {}) failed--customer doesn't exist", self.name, txn, customer);
            return Ok(false);
        };

        for reserved in cust.reservations.values() {
            match view.read_item(&reserved.key).await? {
                Some(mut item) => {
                    item.release(reserved.count);
                    info!(
                        "RM[{}]::deleteCustomer({}, {}) released {} x {}",
                        self.name, txn, customer, reserved.count, reserved.key
                    );
                    view.write(Record::Item(item));
                }
                None => warn!(
                    "RM[{}]::deleteCustomer({}, {}) reserved item {} no longer exists",
                    self.name, txn, customer, reserved.key
                ),
            }
        }

        view.remove(&cust.key());
        info!("RM[{}]::deleteCustomer({}, {}) succeeded", self.name, txn, customer);
        Ok(true)
    }

    async fn query_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64> {
        self.query_count(txn, ItemKey::flight(flight_num)).await
    }

    async fn query_cars(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.query_count(txn, ItemKey::car(location)).await
    }

    async fn query_rooms(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.query_count(txn, ItemKey::room(location)).await
    }

    async fn query_flight_price(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64> {
        self.query_price(txn, ItemKey::flight(flight_num)).await
    }

    async fn query_cars_price(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.query_price(txn, ItemKey::car(location)).await
    }

    async fn query_rooms_price(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.query_price(txn, ItemKey::room(location)).await
    }

    async fn query_customer_info(&self, txn: TxnId, customer: CustomerId) -> CoreResult<String> {
        info!("RM[{}]::queryCustomerInfo({}, {}) called", self.name, txn, customer);
        let mut view = self.view(txn).await?;
        match view.read_customer(customer).await? {
            Some(cust) => Ok(cust.bill()),
            None => {
                warn!("RM[{}]::queryCustomerInfo({}, {}) failed--customer doesn't exist", self.name, txn, customer);
                Ok(String::new())
            }
        }
    }

    async fn reserve_flight(&self, txn: TxnId, customer: CustomerId, flight_num: i64) -> CoreResult<bool> {
        self.reserve_item(txn, customer, ItemKey::flight(flight_num), &flight_num.to_string()).await
    }

    async fn reserve_car(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool> {
        self.reserve_item(txn, customer, ItemKey::car(location), location).await
    }

    async fn reserve_room(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool> {
        self.reserve_item(txn, customer, ItemKey::room(location), location).await
    }

    async fn ping(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> CoreResult<bool> {
        info!("RM[{}] shutting down ...", self.name);
        self.shutdown_tx.send_replace(true);
        Ok(true)
    }
}
