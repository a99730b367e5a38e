use anyhow::Context;
use std::process::ExitCode;
use tokio::io::BufReader;
use wayfare_api::{client, remote::Channel};
use wayfare_store::Config;

#[tokio::main]
async fn main() -> ExitCode {
    wayfare_api::init_tracing("warn");

    match session().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn session() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let addr = std::env::args().nth(1).unwrap_or(config.client.coordinator);

    let mut channel = Channel::connect(&addr).await?;
    client::run(&mut channel, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("Client session ended")?;
    Ok(())
}
