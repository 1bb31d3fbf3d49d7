//! REST handlers for bid admission, guard stats and operational endpoints.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bidguard_connector::{BidDecision, BidRequest, BidVeto, GuardRegistry, PlatformGuard};
use bidguard_core::Platform;
use bidguard_resilience::{CircuitState, GuardStats, StatsProvider};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<GuardRegistry>,
    pub node_id: String,
    pub start_time: Instant,
    /// Absent when metrics export is disabled.
    pub prometheus: Option<PrometheusHandle>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

fn lookup(state: &AppState, platform: &str) -> Result<Arc<PlatformGuard>, ApiError> {
    let parsed = platform
        .parse::<Platform>()
        .map_err(|e| error(StatusCode::NOT_FOUND, "unknown_platform", e.to_string()))?;
    state.registry.get(parsed).ok_or_else(|| {
        error(
            StatusCode::NOT_FOUND,
            "platform_disabled",
            format!("no guard registered for {parsed}"),
        )
    })
}

/// POST /v1/platforms/:platform/bid: Run the admission pipeline for one bid.
pub async fn handle_bid(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(request): Json<BidRequest>,
) -> Result<Json<BidDecision>, ApiError> {
    let guard = lookup(&state, &platform)?;

    match guard.decide_bid(&request).await {
        Ok(decision) => Ok(Json(decision)),
        Err(veto @ BidVeto::InvalidRequest(_)) => {
            warn!(platform = %platform, campaign_id = %request.campaign_id, error = %veto, "Bid request validation failed");
            metrics::counter!("bidguard_api_validation_errors_total").increment(1);
            Err(error(StatusCode::BAD_REQUEST, veto.reason(), veto.to_string()))
        }
        Err(veto) => {
            debug!(platform = %platform, campaign_id = %request.campaign_id, reason = veto.reason(), "Bid vetoed");
            Err(error(StatusCode::CONFLICT, veto.reason(), veto.to_string()))
        }
    }
}

/// GET /v1/platforms: Stats for every registered guard.
pub async fn list_platforms(State(state): State<AppState>) -> Json<Vec<GuardStats>> {
    Json(state.registry.all_stats())
}

/// GET /v1/platforms/:platform/stats
pub async fn platform_stats(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> Result<Json<GuardStats>, ApiError> {
    let guard = lookup(&state, &platform)?;
    Ok(Json(guard.stats()))
}

/// GET /metrics: Prometheus text exposition, refreshed from every guard first.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(handle) = &state.prometheus else {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics export disabled\n".to_string(),
        );
    };
    state.registry.publish_all();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// GET /health: Health check endpoint. Degraded while any breaker is open.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let open_breakers: Vec<Platform> = state
        .registry
        .platforms()
        .into_iter()
        .filter(|p| {
            state
                .registry
                .get(*p)
                .is_some_and(|g| g.breaker().state() == CircuitState::Open)
        })
        .collect();

    Json(HealthResponse {
        status: if open_breakers.is_empty() { "healthy" } else { "degraded" }.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        platforms: state.registry.len(),
        open_breakers,
    })
}

/// GET /ready: Readiness probe. Ready once at least one guard is registered.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.registry.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live: Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub platforms: usize,
    pub open_breakers: Vec<Platform>,
}
