use crate::manager::TransactionManager;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Background loop that times out idle transactions and retries decisions
/// still owed to participants. Stops when `shutdown` flips to true or the
/// manager halts at an injected fault.
pub fn spawn_sweeper(
    tm: Arc<TransactionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut halted = tm.halt_signal();
        info!("Transaction sweeper started, checking every {:?}", interval);
        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = halted.wait_for(|point| point.is_some()) => break,
            }

            match tm.sweep_expired().await {
                Ok(expired) if !expired.is_empty() => info!("Timed out transactions: {:?}", expired),
                Ok(_) => {}
                Err(e) => error!("Transaction sweep failed: {}", e),
            }
            match tm.redeliver().await {
                Ok(settled) if settled > 0 => info!("Settled {} pending decisions", settled),
                Ok(_) => {}
                Err(e) => error!("Decision redelivery failed: {}", e),
            }
        }
        info!("Transaction sweeper stopped");
    })
}
