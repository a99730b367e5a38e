use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use wayfare_txn::TxnStats;

/// Prometheus metrics of the coordinator.
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    transactions: IntGaugeVec,
    live: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("wayfare_requests_total", "Line protocol requests handled by the coordinator"),
            &["op", "status"],
        )?;
        let transactions = IntGaugeVec::new(
            Opts::new("wayfare_transactions", "Transactions by lifecycle outcome since start"),
            &["outcome"],
        )?;
        let live = IntGauge::new("wayfare_live_transactions", "Transactions not yet reclaimed")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(live.clone()))?;

        Ok(Self {
            registry,
            requests,
            transactions,
            live,
        })
    }

    pub fn observe_request(&self, op: &str, status: &str) {
        self.requests.with_label_values(&[op, status]).inc();
    }

    /// Text exposition format, with the transaction gauges refreshed first.
    pub fn render(&self, stats: TxnStats, live: usize) -> Result<String, prometheus::Error> {
        self.transactions.with_label_values(&["started"]).set(stats.started as i64);
        self.transactions.with_label_values(&["committed"]).set(stats.committed as i64);
        self.transactions.with_label_values(&["aborted"]).set(stats.aborted as i64);
        self.transactions.with_label_values(&["timed_out"]).set(stats.timed_out as i64);
        self.live.set(live as i64);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
