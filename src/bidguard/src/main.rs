//! BidGuard: admission control for real-money ad bidding.
//!
//! Loads configuration, builds one guard per enabled platform and serves the
//! bid, stats and metrics endpoints.

use bidguard_api::{install_metrics_recorder, ApiServer};
use bidguard_connector::{GuardRegistry, HttpPredictor, Predictor, StaticPredictor};
use bidguard_core::config::AppConfig;
use bidguard_core::{GuardResult, Platform, SystemClock};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bidguard")]
#[command(about = "Budget, rate-limit and circuit-breaker guard for ad bidding")]
#[command(version)]
struct Cli {
    /// Path to a config file (TOML/YAML/JSON, extension optional)
    #[arg(long, short)]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "BIDGUARD__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "BIDGUARD__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Answer every prediction with this fixed value instead of calling the predictor
    #[arg(long)]
    offline: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bidguard=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("BidGuard starting up");

    // Invalid configuration is permanent: refuse to start rather than default.
    let mut config = AppConfig::load(cli.config.as_deref())?;

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        predictor = %config.predictor.url,
        offline = cli.offline.is_some(),
        "Configuration loaded"
    );

    let prometheus = if config.metrics.enabled {
        Some(install_metrics_recorder()?)
    } else {
        warn!("Metrics export disabled");
        None
    };

    let predictor_config = config.predictor.clone();
    let offline = cli.offline;
    let registry = GuardRegistry::from_config(
        &config,
        SystemClock::shared(),
        |platform: Platform| -> GuardResult<Arc<dyn Predictor>> {
            match offline {
                Some(value) => Ok(Arc::new(StaticPredictor::new(value))),
                None => Ok(Arc::new(HttpPredictor::new(
                    predictor_config.url.clone(),
                    platform,
                    predictor_config.deadline(),
                )?)),
            }
        },
    )?;
    if registry.is_empty() {
        warn!("No platforms enabled; every bid will be rejected");
    }
    let registry = Arc::new(registry);

    // Keep gauges fresh between scrapes.
    if prometheus.is_some() {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;
                registry.publish_all();
            }
        });
    }

    let api_server = ApiServer::new(config, registry, prometheus);

    info!("BidGuard is ready to serve traffic");

    api_server
        .start_http(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    Ok(())
}
