use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use wayfare_shared::models::FaultPoint;
use wayfare_shared::ResourceKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub resource_managers: ResourceManagersConfig,
    pub transactions: TransactionConfig,
    pub itinerary: ItineraryConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceManagersConfig {
    pub flight: String,
    pub car: String,
    pub room: String,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl ResourceManagersConfig {
    pub fn address(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::Flight => &self.flight,
            ResourceKind::Car => &self.car,
            ResourceKind::Room => &self.room,
        }
    }

    pub fn set_address(&mut self, kind: ResourceKind, address: String) {
        match kind {
            ResourceKind::Flight => self.flight = address,
            ResourceKind::Car => self.car = address,
            ResourceKind::Room => self.room = address,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionConfig {
    pub journal_path: PathBuf,
    pub timeout_seconds: u64,
    pub sweep_interval_ms: u64,
    #[serde(default = "default_retained_outcomes")]
    pub retained_outcomes: usize,
    /// Halts the coordinator at this point of the next commit. Recovery testing only.
    #[serde(default)]
    pub fault_point: Option<FaultPoint>,
}

fn default_retained_outcomes() -> usize { 1024 }

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// How the coordinator treats an itinerary whose legs partially fail.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItineraryMode {
    /// Reserve every leg, report the AND of the results, undo nothing.
    #[default]
    BestEffort,
    /// Any failed leg aborts the transaction carrying the itinerary.
    Atomic,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ItineraryConfig {
    #[serde(default)]
    pub mode: ItineraryMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub coordinator: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default("admin.enabled", true)?
            .set_default("admin.port", 5080)?
            .set_default("resource_managers.flight", "127.0.0.1:5001")?
            .set_default("resource_managers.car", "127.0.0.1:5002")?
            .set_default("resource_managers.room", "127.0.0.1:5003")?
            .set_default("resource_managers.connect_attempts", 5)?
            .set_default("resource_managers.retry_delay_ms", 5000)?
            .set_default("transactions.journal_path", "data/tm_journal.json")?
            .set_default("transactions.timeout_seconds", 60)?
            .set_default("transactions.sweep_interval_ms", 1000)?
            .set_default("itinerary.mode", "best_effort")?
            .set_default("client.coordinator", "127.0.0.1:5000")?
            .add_source(config::File::with_name("config/default").required(false))
            // Per-environment overrides, e.g. config/production.toml
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // WAYFARE__TRANSACTIONS__TIMEOUT_SECONDS=30 and friends
            .add_source(config::Environment::with_prefix("WAYFARE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
