// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Subscription and options-chain
// failures come back as `PipelineError` responses with a JSON `error` field.
//
// CORS is configured permissively for development; tighten it in production.
// =============================================================================

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::{delete, get, put},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::analyzer::ControllerSnapshot;
use crate::error::PipelineError;
use crate::options::OptionsChain;
use crate::pipeline::PipelineHandle;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and the pipeline handle.
pub fn router(pipeline: PipelineHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/ticker/add", put(add_ticker))
        .route("/api/v1/ticker/remove", delete(remove_ticker))
        .route("/api/v1/options_chain", get(options_chain))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(pipeline)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    viewers: usize,
    server_time: i64,
}

async fn health(State(pipeline): State<PipelineHandle>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        viewers: pipeline.fanout().viewer_count(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// State
// =============================================================================

async fn full_state(State(pipeline): State<PipelineHandle>) -> Result<Json<Vec<ControllerSnapshot>>, PipelineError> {
    Ok(Json(pipeline.snapshots().await?))
}

// =============================================================================
// Ticker subscription
// =============================================================================

#[derive(Deserialize)]
struct TickerQuery {
    ticker: String,
}

#[derive(Debug, Serialize)]
struct RemoveResponse {
    symbol: String,
    message: String,
}

async fn add_ticker(
    State(pipeline): State<PipelineHandle>,
    Query(query): Query<TickerQuery>,
) -> Result<Json<ControllerSnapshot>, PipelineError> {
    let snapshot = pipeline.subscribe(&query.ticker).await?;
    info!(symbol = %snapshot.symbol, "ticker added via API");
    Ok(Json(snapshot))
}

async fn remove_ticker(
    State(pipeline): State<PipelineHandle>,
    Query(query): Query<TickerQuery>,
) -> Result<Json<RemoveResponse>, PipelineError> {
    let symbol = pipeline.unsubscribe(&query.ticker).await?;
    info!(symbol = %symbol, "ticker removed via API");
    Ok(Json(RemoveResponse {
        message: format!("{symbol} unsubscribed"),
        symbol,
    }))
}

// =============================================================================
// Options chain
// =============================================================================

#[derive(Deserialize)]
struct OptionsChainQuery {
    ticker: String,
    #[serde(default)]
    strike_count: Option<u32>,
    #[serde(default)]
    from: Option<NaiveDate>,
    #[serde(default)]
    to: Option<NaiveDate>,
}

async fn options_chain(
    State(pipeline): State<PipelineHandle>,
    Query(query): Query<OptionsChainQuery>,
) -> Result<Json<OptionsChain>, PipelineError> {
    let chain = pipeline
        .options_chain(&query.ticker, query.strike_count, query.from, query.to)
        .await?;
    Ok(Json(chain))
}
