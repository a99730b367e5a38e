use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod admin;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod item;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod state;

pub use coordinator::Coordinator;
pub use state::AppState;

/// Admin HTTP router of the coordinator.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(admin::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` or `default_filter`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
