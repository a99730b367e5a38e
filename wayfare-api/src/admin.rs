use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wayfare_shared::models::{FaultPoint, Outcome, Transaction};
use wayfare_shared::TxnId;
use wayfare_store::app_config::ItineraryMode;
use wayfare_txn::TxnStats;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub live_transactions: usize,
    pub itinerary_mode: ItineraryMode,
    pub stats: TxnStats,
}

#[derive(Debug, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub idle_millis: i64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransactionLookup {
    Live(TransactionView),
    Finished { id: TxnId, outcome: Outcome },
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub id: TxnId,
    pub outcome: Outcome,
}

#[derive(Debug, Deserialize)]
pub struct ArmFaultRequest {
    pub point: Option<FaultPoint>,
}

#[derive(Debug, Serialize)]
pub struct FaultResponse {
    pub armed: Option<FaultPoint>,
    pub halted: Option<FaultPoint>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/transactions", get(list_transactions))
        .route(
            "/v1/transactions/{id}",
            get(get_transaction).delete(remove_transaction),
        )
        .route("/v1/faults", get(get_faults).put(arm_fault))
}

fn view(transaction: Transaction, now: DateTime<Utc>) -> TransactionView {
    TransactionView {
        idle_millis: transaction.idle_millis(now),
        transaction,
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        live_transactions: state.tm.transactions().await.len(),
        itinerary_mode: state.coordinator.mode(),
        stats: state.tm.stats(),
    })
}

/// GET /metrics
async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let live = state.tm.transactions().await.len();
    let body = state.metrics.render(state.tm.stats(), live)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// GET /v1/transactions
async fn list_transactions(State(state): State<AppState>) -> Json<Vec<TransactionView>> {
    let now = Utc::now();
    Json(state.tm.transactions().await.into_iter().map(|t| view(t, now)).collect())
}

/// GET /v1/transactions/{id}
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransactionLookup>, AppError> {
    let id = TxnId(id);
    if let Some(transaction) = state.tm.transaction(id).await {
        return Ok(Json(TransactionLookup::Live(view(transaction, Utc::now()))));
    }
    match state.tm.outcome(id).await {
        Some(outcome) => Ok(Json(TransactionLookup::Finished { id, outcome })),
        None => Err(AppError::NotFoundError(format!("Transaction {} not found", id))),
    }
}

/// DELETE /v1/transactions/{id}
///
/// Gives up on delivering a decision to an RM that never came back.
async fn remove_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RemovedResponse>, AppError> {
    let id = TxnId(id);
    let outcome = state.tm.remove_transaction(id).await?;
    tracing::warn!("Transaction {} removed by operator with outcome {:?}", id, outcome);
    Ok(Json(RemovedResponse { id, outcome }))
}

// ============================================================================
// Fault injection
// ============================================================================

async fn fault_status(state: &AppState) -> FaultResponse {
    let armed = state.tm.armed_fault().await;
    let halted = *state.tm.halt_signal().borrow();
    FaultResponse { armed, halted }
}

/// GET /v1/faults
async fn get_faults(State(state): State<AppState>) -> Json<FaultResponse> {
    Json(fault_status(&state).await)
}

/// PUT /v1/faults
///
/// Arms a one-shot halt for the next commit, or disarms with `{"point": null}`.
async fn arm_fault(
    State(state): State<AppState>,
    Json(req): Json<ArmFaultRequest>,
) -> Json<FaultResponse> {
    state.tm.arm_fault(req.point).await;
    Json(fault_status(&state).await)
}
