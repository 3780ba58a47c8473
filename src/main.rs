mod config;
mod db;
mod errors;
mod keeper;
mod math;
mod models;
mod pool;
mod server;
mod state;

use crate::pool::{ManualPriceFeed, Pool, PoolHandle};
use crate::state::{AppState, DbCommand};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // Structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("pooled_options starting");

    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };
    let pool_cfg = match cfg.pool_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    // Spot price source shared by the HTTP layer and the pool
    let feed = ManualPriceFeed::new();
    if let Some(price) = cfg.initial_spot_price {
        if let Err(e) = feed.set_price(price) {
            tracing::error!("INITIAL_SPOT_PRICE: {e}");
            std::process::exit(1);
        }
    }

    let pool = match Pool::new(pool_cfg, Arc::new(feed.clone())) {
        Ok(p) => Arc::new(PoolHandle::new(p)),
        Err(e) => {
            tracing::error!("pool init error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        underlying_decimals = cfg.underlying_decimals,
        base_decimals = cfg.base_decimals,
        fee_rate = cfg.fee_rate,
        steepness = cfg.steepness,
        call_surface = cfg.call_surface.is_some(),
        put_surface = cfg.put_surface.is_some(),
        "pool initialized"
    );

    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);
    let app_state = AppState::new(db_pool.clone(), pool, feed, db_tx);

    // ── Spawn tasks ──

    // 1. DB writer task (dedicated, owns the DB connection for writes)
    let db_pool_writer = db_pool.clone();
    tokio::spawn(async move {
        db::run_db_writer(db_pool_writer, db_rx).await;
    });

    // 2. Expiry keeper
    let keeper_state = app_state.clone();
    let keeper_period = cfg.keeper_interval_secs;
    tokio::spawn(async move {
        keeper::run_expiry_keeper(keeper_state, keeper_period).await;
    });

    // 3. Axum HTTP + WS server
    let app = server::router(app_state);
    let addr = format!("0.0.0.0:{}", cfg.server_port);
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
    }
}
