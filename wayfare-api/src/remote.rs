use crate::item::ItemRef;
use crate::protocol::{decode_response, expect_bool, expect_int, expect_text, Request};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wayfare_core::{CoreError, CoreResult, Participant, ResourceManager};
use wayfare_shared::{CustomerId, ResourceKind, TxnId};

/// One line-protocol connection with at most one request in flight.
pub struct Channel {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    pub async fn connect(addr: &str) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::Unavailable(format!("cannot connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Connects, retrying `attempts` times with `delay` in between.
    pub async fn connect_with_retry(addr: &str, attempts: u32, delay: Duration) -> CoreResult<Self> {
        let mut attempt = 1;
        loop {
            match Self::connect(addr).await {
                Ok(channel) => return Ok(channel),
                Err(e) if attempt < attempts.max(1) => {
                    warn!("Attempt {} to reach {} failed: {}. Retrying in {:?}", attempt, addr, e, delay);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends one request and waits for its response line.
    pub async fn call(&mut self, request: &Request) -> CoreResult<Option<String>> {
        let line = request.encode();
        debug!("-> {} {}", self.addr, line);
        let io_error = |e: std::io::Error| CoreError::Unavailable(format!("{}: {}", self.addr, e));

        self.writer.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.writer.write_all(b"\n").await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)?;

        let mut response = String::new();
        let read = self.reader.read_line(&mut response).await.map_err(io_error)?;
        if read == 0 {
            return Err(CoreError::Unavailable(format!("{} closed the connection", self.addr)));
        }
        debug!("<- {} {}", self.addr, response.trim_end());
        decode_response(&response)
    }
}

/// Client-side proxy for a resource manager reached over the line protocol.
///
/// Holds a single connection; a broken connection is dropped and re-established
/// on the next call.
pub struct RemoteResourceManager {
    kind: ResourceKind,
    addr: String,
    channel: Mutex<Option<Channel>>,
}

impl RemoteResourceManager {
    /// Connects eagerly, retrying as configured.
    pub async fn connect(kind: ResourceKind, addr: &str, attempts: u32, delay: Duration) -> CoreResult<Self> {
        let channel = Channel::connect_with_retry(addr, attempts, delay).await?;
        info!("Connected to {} RM at {}", kind, addr);
        Ok(Self {
            kind,
            addr: addr.to_string(),
            channel: Mutex::new(Some(channel)),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn call(&self, request: Request) -> CoreResult<Option<String>> {
        let mut slot = self.channel.lock().await;
        if slot.is_none() {
            *slot = Some(Channel::connect(&self.addr).await?);
            info!("Reconnected to {} RM at {}", self.kind, self.addr);
        }
        let Some(channel) = slot.as_mut() else {
            return Err(CoreError::Unavailable(format!("no connection to {}", self.addr)));
        };
        let result = channel.call(&request).await;
        if matches!(result, Err(CoreError::Unavailable(_))) {
            warn!("Lost connection to {} RM at {}", self.kind, self.addr);
            *slot = None;
        }
        result
    }

    async fn call_bool(&self, request: Request) -> CoreResult<bool> {
        expect_bool(self.call(request).await?)
    }

    async fn call_int(&self, request: Request) -> CoreResult<i64> {
        expect_int(self.call(request).await?)
    }
}

#[async_trait]
impl Participant for RemoteResourceManager {
    async fn prepare(&self, txn: TxnId) -> CoreResult<bool> {
        self.call_bool(Request::Prepare(txn)).await
    }

    async fn commit(&self, txn: TxnId) -> CoreResult<bool> {
        self.call_bool(Request::Commit(txn)).await
    }

    async fn abort(&self, txn: TxnId) -> CoreResult<()> {
        self.call(Request::Abort(txn)).await.map(|_| ())
    }
}

#[async_trait]
impl ResourceManager for RemoteResourceManager {
    async fn add_flight(&self, txn: TxnId, flight_num: i64, seats: i64, price: i64) -> CoreResult<bool> {
        self.call_bool(Request::Add {
            txn,
            item: ItemRef::Flight(flight_num),
            count: seats,
            price,
        })
        .await
    }

    async fn add_cars(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool> {
        self.call_bool(Request::Add {
            txn,
            item: ItemRef::Car(location.to_string()),
            count,
            price,
        })
        .await
    }

    async fn add_rooms(&self, txn: TxnId, location: &str, count: i64, price: i64) -> CoreResult<bool> {
        self.call_bool(Request::Add {
            txn,
            item: ItemRef::Room(location.to_string()),
            count,
            price,
        })
        .await
    }

    async fn new_customer(&self, txn: TxnId) -> CoreResult<CustomerId> {
        self.call_int(Request::NewCustomer(txn)).await
    }

    async fn new_customer_with_id(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        self.call_bool(Request::NewCustomerId { txn, customer }).await
    }

    async fn delete_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<bool> {
        self.call_bool(Request::Delete {
            txn,
            item: ItemRef::Flight(flight_num),
        })
        .await
    }

    async fn delete_cars(&self, txn: TxnId, location: &str) -> CoreResult<bool> {
        self.call_bool(Request::Delete {
            txn,
            item: ItemRef::Car(location.to_string()),
        })
        .await
    }

    async fn delete_rooms(&self, txn: TxnId, location: &str) -> CoreResult<bool> {
        self.call_bool(Request::Delete {
            txn,
            item: ItemRef::Room(location.to_string()),
        })
        .await
    }

    async fn delete_customer(&self, txn: TxnId, customer: CustomerId) -> CoreResult<bool> {
        self.call_bool(Request::DeleteCustomer { txn, customer }).await
    }

    async fn query_flight(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64> {
        self.call_int(Request::Query {
            txn,
            item: ItemRef::Flight(flight_num),
        })
        .await
    }

    async fn query_cars(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.call_int(Request::Query {
            txn,
            item: ItemRef::Car(location.to_string()),
        })
        .await
    }

    async fn query_rooms(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.call_int(Request::Query {
            txn,
            item: ItemRef::Room(location.to_string()),
        })
        .await
    }

    async fn query_flight_price(&self, txn: TxnId, flight_num: i64) -> CoreResult<i64> {
        self.call_int(Request::QueryPrice {
            txn,
            item: ItemRef::Flight(flight_num),
        })
        .await
    }

    async fn query_cars_price(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.call_int(Request::QueryPrice {
            txn,
            item: ItemRef::Car(location.to_string()),
        })
        .await
    }

    async fn query_rooms_price(&self, txn: TxnId, location: &str) -> CoreResult<i64> {
        self.call_int(Request::QueryPrice {
            txn,
            item: ItemRef::Room(location.to_string()),
        })
        .await
    }

    async fn query_customer_info(&self, txn: TxnId, customer: CustomerId) -> CoreResult<String> {
        expect_text(self.call(Request::QueryCustomerInfo { txn, customer }).await?)
    }

    async fn reserve_flight(&self, txn: TxnId, customer: CustomerId, flight_num: i64) -> CoreResult<bool> {
        self.call_bool(Request::Reserve {
            txn,
            customer,
            item: ItemRef::Flight(flight_num),
        })
        .await
    }

    async fn reserve_car(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool> {
        self.call_bool(Request::Reserve {
            txn,
            customer,
            item: ItemRef::Car(location.to_string()),
        })
        .await
    }

    async fn reserve_room(&self, txn: TxnId, customer: CustomerId, location: &str) -> CoreResult<bool> {
        self.call_bool(Request::Reserve {
            txn,
            customer,
            item: ItemRef::Room(location.to_string()),
        })
        .await
    }

    async fn ping(&self) -> CoreResult<()> {
        self.call(Request::Ping).await.map(|_| ())
    }

    async fn shutdown(&self) -> CoreResult<bool> {
        self.call_bool(Request::Shutdown).await
    }
}
