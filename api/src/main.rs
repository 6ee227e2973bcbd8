//! tally-api
//!
//! Wires the billing service together: Postgres repository, redis-backed
//! rate cache, machine runtime, and the axum HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use tally_api::{build_router, AppState};
use tally_common::AppConfig;
use tally_core::{BillingService, MachineRuntime};
use tally_rates::{ExchangeRates, RatesService, RedisRatesCache};
use tally_repository::{Repository, SqlRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cfg = Arc::new(AppConfig::load());
    info!("configuration loaded");

    let sql_repository = SqlRepository::connect(&cfg.database).await?;
    sql_repository.run_migrations().await?;
    let repository: Arc<dyn Repository> = Arc::new(sql_repository);
    info!("repository initialized");

    let cache = Arc::new(
        RedisRatesCache::new(&cfg.redis.url, Duration::from_secs(cfg.rates.ttl_secs)).await?,
    );
    let rates: Arc<dyn ExchangeRates> = Arc::new(RatesService::new(cfg.rates.clone(), cache)?);
    info!("rate service initialized");

    let runtime = MachineRuntime::with_system_clock();
    let service = Arc::new(BillingService::new(
        Arc::clone(&cfg),
        runtime,
        repository,
        rates,
    ));
    info!("billing service initialized");

    let app = build_router(AppState {
        service,
        cfg: Arc::clone(&cfg),
    });

    let addr = format!("{}:{}", cfg.http.host, cfg.http.port);
    info!(addr = %addr, "tally API starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
