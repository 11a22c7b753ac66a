//! HTTP API for health checks, endpoint status and account inspection

use crate::chain::{ConnectionManager, EndpointHealth};
use crate::config::ApiConfig;
use crate::error::{WalletError, WalletResult};
use crate::ledger::{PendingLedger, PendingTransaction};
use crate::tx::{parse_address, GapReport, NonceCoordinator, NonceStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub ledger: Arc<PendingLedger>,
    pub nonces: Arc<NonceCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains/:chain/endpoints", get(get_endpoints))
        .route("/accounts/:chain/:address/pending", get(get_pending))
        .route("/accounts/:chain/:address/nonce", get(get_nonce))
        .route("/accounts/:chain/:address/gaps", get(get_gaps))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> WalletResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WalletError::Config(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| WalletError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every configured chain has a reachable endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut details = Vec::new();
    for chain_key in state.connections.chain_keys() {
        let healthy = state.connections.health_check(&chain_key).await;
        details.push(ChainHealth { chain_key, healthy });
    }
    let ready = details.iter().all(|c| c.healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, chains: details }))
}

async fn get_endpoints(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<EndpointsResponse>, ApiError> {
    let endpoints = state.connections.endpoint_health(&chain)?;
    let last_known_good = state.connections.last_known_good(&chain).await;
    Ok(Json(EndpointsResponse {
        chain_key: chain,
        last_known_good,
        endpoints,
    }))
}

async fn get_pending(
    State(state): State<AppState>,
    Path((chain, address)): Path<(String, String)>,
) -> Result<Json<Vec<PendingTransaction>>, ApiError> {
    state.connections.chain(&chain)?;
    let address = parse_address(&address)?;
    Ok(Json(state.ledger.entries(&chain, address).await?))
}

async fn get_nonce(
    State(state): State<AppState>,
    Path((chain, address)): Path<(String, String)>,
) -> Result<Json<NonceStatus>, ApiError> {
    let address = parse_address(&address)?;
    Ok(Json(state.nonces.status(&chain, address).await?))
}

async fn get_gaps(
    State(state): State<AppState>,
    Path((chain, address)): Path<(String, String)>,
) -> Result<Json<GapReport>, ApiError> {
    let address = parse_address(&address)?;
    Ok(Json(state.nonces.detect_gap(&chain, address).await?))
}

/// `WalletError` rendered as a JSON error body
struct ApiError(WalletError);

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "validation" | "chain_id_mismatch" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "transport" | "timeout" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_key: String,
    healthy: bool,
}

#[derive(Serialize)]
struct EndpointsResponse {
    chain_key: String,
    last_known_good: Option<String>,
    endpoints: Vec<EndpointHealth>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}
