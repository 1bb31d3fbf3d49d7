//! HTTP server exposing bid admission, guard stats and the Prometheus scrape endpoint.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use bidguard_connector::GuardRegistry;
use bidguard_core::config::AppConfig;
use bidguard_resilience::metrics::{LATENCY_BUCKETS_MS, LATENCY_HISTOGRAM};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Install the global Prometheus recorder with the fixed predictor latency buckets.
pub fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(LATENCY_HISTOGRAM.to_string()), &LATENCY_BUCKETS_MS)?
        .install_recorder()?;
    info!(histogram = LATENCY_HISTOGRAM, "Prometheus recorder installed");
    Ok(handle)
}

pub struct ApiServer {
    config: AppConfig,
    registry: Arc<GuardRegistry>,
    prometheus: Option<PrometheusHandle>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        registry: Arc<GuardRegistry>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config,
            registry,
            prometheus,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            prometheus: self.prometheus.clone(),
        };
        build_router(state)
    }

    /// Serve until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, platforms = self.registry.len(), "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/platforms", get(rest::list_platforms))
        .route("/v1/platforms/:platform/stats", get(rest::platform_stats))
        .route("/v1/platforms/:platform/bid", post(rest::handle_bid))
        // Operational endpoints
        .route("/metrics", get(rest::metrics_handler))
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use bidguard_connector::{Predictor, StaticPredictor};
    use bidguard_core::{GuardResult, ManualClock, Platform};
    use tower::ServiceExt;

    fn app(burst_limit: f64) -> Router {
        let mut config = AppConfig::default();
        config.budget.burst_limit = burst_limit;
        config.platforms.retain(|k, _| k == "google_ads" || k == "reddit");
        let registry = GuardRegistry::from_config(
            &config,
            Arc::new(ManualClock::default()),
            |_: Platform| -> GuardResult<Arc<dyn Predictor>> { Ok(Arc::new(StaticPredictor::new(12.0))) },
        )
        .unwrap();
        let prometheus = PrometheusBuilder::new().build_recorder().handle();
        ApiServer::new(config, Arc::new(registry), Some(prometheus)).router()
    }

    fn bid(platform: &str, max_bid: f64) -> Request<Body> {
        let body = serde_json::json!({
            "campaign_id": "cmp-7",
            "max_bid": max_bid,
            "default_value": 2.0
        });
        Request::post(format!("/v1/platforms/{platform}/bid"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_bid_admitted() {
        let response = app(1000.0).oneshot(bid("google_ads", 10.0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["amount"], 10.0);
        assert_eq!(body["predicted_value"], 12.0);
        assert_eq!(body["source"], "ai");
        assert_eq!(body["platform"], "google_ads");
    }

    #[tokio::test]
    async fn test_budget_veto_is_conflict() {
        let app = app(15.0);
        let first = app.clone().oneshot(bid("reddit", 10.0)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(bid("reddit", 10.0)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(json(second).await["error"], "budget_exceeded");
    }

    #[tokio::test]
    async fn test_invalid_bid_is_bad_request() {
        let response = app(1000.0).oneshot(bid("google_ads", -1.0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_platforms() {
        let app = app(1000.0);
        let unknown = app.clone().oneshot(bid("friendster", 1.0)).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(unknown).await["error"], "unknown_platform");

        let disabled = app
            .oneshot(
                Request::get("/v1/platforms/tiktok/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(disabled.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(disabled).await["error"], "platform_disabled");
    }

    #[tokio::test]
    async fn test_stats_listing() {
        let response = app(1000.0)
            .oneshot(Request::get("/v1/platforms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        let platforms: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["platform"].as_str().unwrap())
            .collect();
        assert_eq!(platforms, vec!["google_ads", "reddit"]);
        assert_eq!(body[0]["breaker"]["state"], "closed");
    }

    #[tokio::test]
    async fn test_operational_endpoints() {
        let app = app(1000.0);
        for path in ["/live", "/ready", "/metrics"] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json(health).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["platforms"], 2);
    }
}
