use wayfare_core::{CoreResult, ResourceManager};
use wayfare_shared::{CustomerId, ResourceKind, TxnId};

/// A reservable item as addressed on the wire: a flight number or a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRef {
    Flight(i64),
    Car(String),
    Room(String),
}

impl ItemRef {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ItemRef::Flight(_) => ResourceKind::Flight,
            ItemRef::Car(_) => ResourceKind::Car,
            ItemRef::Room(_) => ResourceKind::Room,
        }
    }

    /// The identifying field as it appears in a command line.
    pub fn field(&self) -> String {
        match self {
            ItemRef::Flight(num) => num.to_string(),
            ItemRef::Car(location) | ItemRef::Room(location) => location.clone(),
        }
    }

    pub async fn add(&self, rm: &dyn ResourceManager, txn: TxnId, count: i64, price: i64) -> CoreResult<bool> {
        match self {
            ItemRef::Flight(num) => rm.add_flight(txn, *num, count, price).await,
            ItemRef::Car(location) => rm.add_cars(txn, location, count, price).await,
            ItemRef::Room(location) => rm.add_rooms(txn, location, count, price).await,
        }
    }

    pub async fn delete(&self, rm: &dyn ResourceManager, txn: TxnId) -> CoreResult<bool> {
        match self {
            ItemRef::Flight(num) => rm.delete_flight(txn, *num).await,
            ItemRef::Car(location) => rm.delete_cars(txn, location).await,
            ItemRef::Room(location) => rm.delete_rooms(txn, location).await,
        }
    }

    pub async fn query(&self, rm: &dyn ResourceManager, txn: TxnId) -> CoreResult<i64> {
        match self {
            ItemRef::Flight(num) => rm.query_flight(txn, *num).await,
            ItemRef::Car(location) => rm.query_cars(txn, location).await,
            ItemRef::Room(location) => rm.query_rooms(txn, location).await,
        }
    }

    pub async fn query_price(&self, rm: &dyn ResourceManager, txn: TxnId) -> CoreResult<i64> {
        match self {
            ItemRef::Flight(num) => rm.query_flight_price(txn, *num).await,
            ItemRef::Car(location) => rm.query_cars_price(txn, location).await,
            ItemRef::Room(location) => rm.query_rooms_price(txn, location).await,
        }
    }

    pub async fn reserve(&self, rm: &dyn ResourceManager, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        match self {
            ItemRef::Flight(num) => rm.reserve_flight(txn, customer, *num).await,
            ItemRef::Car(location) => rm.reserve_car(txn, customer, location).await,
            ItemRef::Room(location) => rm.reserve_room(txn, customer, location).await,
        }
    }
}
