use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use wayfare_api::metrics::Metrics;
use wayfare_api::remote::RemoteResourceManager;
use wayfare_api::server::serve;
use wayfare_api::{app, AppState, Coordinator};
use wayfare_core::{Participant, ResourceManager};
use wayfare_shared::ResourceKind;
use wayfare_store::{Config, FileJournal};
use wayfare_txn::{spawn_sweeper, TransactionManager, TxnSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wayfare_api::init_tracing("wayfare_api=debug,wayfare_txn=debug,tower_http=debug");

    // wayfare-middleware [port] [flight host:port] [car host:port] [room host:port]
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(port) = args.first() {
        config.server.port = port.parse().with_context(|| format!("invalid port '{}'", port))?;
    }
    for (kind, addr) in ResourceKind::ALL.into_iter().zip(args.iter().skip(1)) {
        config.resource_managers.set_address(kind, addr.clone());
    }

    let mut rms: HashMap<ResourceKind, Arc<dyn ResourceManager>> = HashMap::new();
    let mut participants: HashMap<ResourceKind, Arc<dyn Participant>> = HashMap::new();
    for kind in ResourceKind::ALL {
        let addr = config.resource_managers.address(kind);
        let rm = Arc::new(
            RemoteResourceManager::connect(
                kind,
                addr,
                config.resource_managers.connect_attempts,
                config.resource_managers.retry_delay(),
            )
            .await
            .with_context(|| format!("cannot reach the {} RM at {}", kind, addr))?,
        );
        rms.insert(kind, rm.clone());
        participants.insert(kind, rm);
    }

    let journal = Arc::new(FileJournal::new(&config.transactions.journal_path));
    let settings = TxnSettings {
        timeout: config.transactions.timeout(),
        retained_outcomes: config.transactions.retained_outcomes,
    };
    let tm = Arc::new(
        TransactionManager::open(participants, journal, settings)
            .await
            .context("Failed to recover transaction journal")?,
    );
    if let Some(point) = config.transactions.fault_point {
        tm.arm_fault(Some(point)).await;
    }
    let metrics = Arc::new(Metrics::new().map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?);
    let coordinator = Arc::new(Coordinator::new(rms, tm.clone(), config.itinerary.mode, metrics)?);
    let shutdown = coordinator.shutdown_signal();

    let sweeper = spawn_sweeper(tm.clone(), config.transactions.sweep_interval(), shutdown.clone());

    if config.admin.enabled {
        let listener = TcpListener::bind((config.server.host.as_str(), config.admin.port))
            .await
            .with_context(|| format!("cannot listen on admin port {}", config.admin.port))?;
        tracing::info!("Admin API listening on {}", listener.local_addr()?);
        let router = app(AppState::new(coordinator.clone()));
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!("Admin API failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("cannot listen on port {}", config.server.port))?;
    tracing::info!(
        "Starting Wayfare middleware on port {} ({:?} itineraries)",
        config.server.port,
        config.itinerary.mode
    );
    let mut halted = tm.halt_signal();
    tokio::select! {
        served = serve(listener, coordinator, shutdown) => served?,
        halt = halted.wait_for(|point| point.is_some()) => {
            let point = halt.ok().and_then(|point| *point);
            anyhow::bail!("Middleware halted at injected fault {:?}. Restart it to recover from the journal", point);
        }
    }

    sweeper.await.context("Sweeper task failed")?;
    tracing::info!("Middleware stopped");
    Ok(())
}
