use crate::coordinator::Coordinator;
use crate::metrics::Metrics;
use std::sync::Arc;
use wayfare_txn::TransactionManager;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub tm: Arc<TransactionManager>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            tm: coordinator.tm().clone(),
            metrics: coordinator.metrics().clone(),
            coordinator,
        }
    }
}
