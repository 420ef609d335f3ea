use anyhow::Result;
use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portfolio_ratelimit::{
    config::{load_settings, TierTable},
    filter::AdmissionFilter,
    limiter::RateLimiter,
    metrics::Metrics,
    registry::BucketRegistry,
    server::{build_router, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portfolio_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting portfolio rate limit service");

    let filter = create_filter()?;
    let state = AppState { filter };

    let http_addr = std::env::var("HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let app = build_router(state, Router::new());
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

fn create_filter() -> Result<Arc<AdmissionFilter>> {
    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }

    let settings = load_settings(config_path.as_deref())?;
    let tiers = TierTable::compile(&settings)?;

    for tier in tiers.iter() {
        info!(
            tier = %tier.name,
            capacity = tier.capacity,
            refill_secs = tier.refill_period.as_secs(),
            "Rate limit tier loaded"
        );
    }
    info!(enabled = settings.enabled, "Rate limiting configured");

    let metrics = Arc::new(Metrics::new()?);
    let registry = Arc::new(BucketRegistry::new());
    let limiter = RateLimiter::new(tiers, registry);

    Ok(Arc::new(AdmissionFilter::new(settings.enabled, limiter, metrics)))
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
    }
}
