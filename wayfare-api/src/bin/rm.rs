use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use wayfare_api::server::serve;
use wayfare_catalog::InventoryManager;
use wayfare_shared::ResourceKind;
use wayfare_store::Config;

const USAGE: &str = "usage: wayfare-rm <flight|car|room> [port]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wayfare_api::init_tracing("wayfare_catalog=debug,wayfare_api=info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let kind: ResourceKind = args.first().context(USAGE)?.parse().context(USAGE)?;
    let config = Config::load().context("Failed to load config")?;

    let port = match args.get(1) {
        Some(port) => port.parse::<u16>().with_context(|| format!("invalid port '{}'", port))?,
        None => {
            let addr = config.resource_managers.address(kind);
            addr.rsplit_once(':')
                .and_then(|(_, port)| port.parse().ok())
                .with_context(|| format!("no port in configured address '{}'", addr))?
        }
    };

    let rm = Arc::new(InventoryManager::new(kind.as_str(), kind));
    let listener = TcpListener::bind((config.server.host.as_str(), port))
        .await
        .with_context(|| format!("cannot listen on port {}", port))?;
    tracing::info!("Starting {} resource manager on port {}", kind, port);

    serve(listener, rm.clone(), rm.shutdown_signal()).await?;
    tracing::info!("{} resource manager stopped", kind);
    Ok(())
}
