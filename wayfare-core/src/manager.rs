use async_trait::async_trait;
use wayfare_shared::{CustomerId, TxnId};

use crate::CoreResult;

/// RM side of the two-phase commit protocol.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Phase one. `Ok(true)` is a yes vote.
    async fn prepare(&self, txn: TxnId) -> CoreResult<bool>;

    /// Phase two, commit decision: merge the transaction's view into the committed table.
    async fn commit(&self, txn: TxnId) -> CoreResult<bool>;

    /// Phase two, abort decision: discard the transaction's view.
    async fn abort(&self, txn: TxnId) -> CoreResult<()>;
}

/// Operations a resource manager exposes, local or remote.
///
/// Every call is scoped by a transaction id. `Ok(false)`, `Ok(0)` and `Ok("")`
/// are business answers; `Err` is reserved for systemic failures.
#[async_trait]
pub trait ResourceManager: Participant {
    async fn add_flight(&self, txn: TxnId, flight_num: i64, seats: i64, price: i64) -> CoreResult<bool>;
    async fn add_cars(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool>;
    async fn add_rooms(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool>;

    async fn new_customer(&self, txn: TxnId) -> CoreResult<CustomerId>;
    async fn new_customer_with_id(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool>;

    async fn delete_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<bool>;
    async fn delete_cars(&self, txn: TxnId, location: &str) -> CoreResult<bool>;
    async fn delete_rooms(&self, txn: TxnId, location: &str) -> CoreResult<bool>;
    async fn delete_customer(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool>;

    async fn query_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64>;
    async fn query_cars(&self, txn: TxnId, location: &str) -> CoreResult<i64>;
    async fn query_rooms(&self, txn: TxnId, location: &str) -> CoreResult<i64>;
    async fn query_flight_price(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64>;
    async fn query_cars_price(&self, txn: TxnId, location: &str) -> CoreResult<i64>;
    async fn query_rooms_price(&self, txn: TxnId, location: &str) -> CoreResult<i64>;

    /// Returns `""` when the customer does not exist.
    async fn query_customer_info(&self, txn: TxnId, customer: CustomerId) -> CoreResult<String>;

    async fn reserve_flight(&self, txn: TxnId, customer: CustomerId, flight_num: i64) -> CoreResult<bool>;
    async fn reserve_car(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool>;
    async fn reserve_room(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool>;

    async fn ping(&self) -> CoreResult<()>;
    async fn shutdown(&self) -> CoreResult<bool>;
}
