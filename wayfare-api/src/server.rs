use crate::protocol::{encode_response, Reply, Request};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wayfare_catalog::InventoryManager;
use wayfare_core::{CoreError, CoreResult, ResourceManager};

/// Time given to open connections to flush their last response after shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Something that answers line-protocol requests.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> CoreResult<Reply>;
}

/// Serves a resource manager directly.
pub async fn dispatch_rm(rm: &dyn ResourceManager, request: Request) -> CoreResult<Reply> {
    let reply = match request {
        Request::Prepare(txn) => Reply::Bool(rm.prepare(txn).await?),
        Request::Commit(txn) => Reply::Bool(rm.commit(txn).await?),
        Request::Abort(txn) => {
            rm.abort(txn).await?;
            Reply::Unit
        }
        Request::Ping => {
            rm.ping().await?;
            Reply::Unit
        }
        Request::Shutdown => Reply::Bool(rm.shutdown().await?),
        Request::Add { txn, item, count, price } => Reply::Bool(item.add(rm, txn, count, price).await?),
        Request::NewCustomer(txn) => Reply::Int(rm.new_customer(txn).await?),
        Request::NewCustomerId { txn, customer } => Reply::Bool(rm.new_customer_with_id(txn, customer).await?),
        Request::Delete { txn, item } => Reply::Bool(item.delete(rm, txn).await?),
        Request::DeleteCustomer { txn, customer } => Reply::Bool(rm.delete_customer(txn, customer).await?),
        Request::Query { txn, item } => Reply::Int(item.query(rm, txn).await?),
        Request::QueryPrice { txn, item } => Reply::Int(item.query_price(rm, txn).await?),
        Request::QueryCustomerInfo { txn, customer } => Reply::Text(rm.query_customer_info(txn, customer).await?),
        Request::Reserve { txn, customer, item } => Reply::Bool(item.reserve(rm, txn, customer).await?),
        Request::Start | Request::Itinerary { .. } => {
            return Err(CoreError::Protocol(format!(
                "{} is only served by the coordinator",
                request.name()
            )))
        }
    };
    Ok(reply)
}

#[async_trait]
impl Handler for InventoryManager {
    async fn handle(&self, request: Request) -> CoreResult<Reply> {
        dispatch_rm(self, request).await
    }
}

/// Accepts connections until `shutdown` flips to true, one task per connection.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!("New connection from {}", addr);
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, handler, shutdown).await {
                            warn!("Connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        // Reap finished connection tasks
        while connections.try_join_next().is_some() {}
    }

    info!("Shutting down, draining {} connection(s)", connections.len());
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        connections.abort_all();
    }
    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let result = match Request::parse(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!("Request '{}' failed: {}", line, e);
        }
        let mut response = encode_response(&result);
        response.push('\n');
        write.write_all(response.as_bytes()).await?;
        write.flush().await?;
    }

    debug!("Connection closed");
    Ok(())
}
