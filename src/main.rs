mod config;
mod frame;
mod routes;
mod services;
mod state;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::services::room::RoomDirectory;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::SyncConfig::from_env();
    let port = config.port;
    info!(
        max_history_size = config.history.max_history_size,
        compaction_threshold = config.history.compaction_threshold,
        batch_max_size = config.batch.max_size,
        batch_interval_ms = u64::try_from(config.batch.interval.as_millis()).unwrap_or(u64::MAX),
        "sync config loaded"
    );

    let state = state::AppState::new(config);

    // Spawn background batch flush driver.
    let _flusher = spawn_flush_driver(state.rooms.clone(), config.flush_interval);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    info!(%port, "sketchroom listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");
    info!("sketchroom stopped");
}

/// Flush every room's pending batch on a fixed cadence, independent of the
/// per-room timers.
fn spawn_flush_driver(rooms: RoomDirectory, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let flushed = rooms.flush_all_batches().await;
            if flushed > 0 {
                debug!(flushed, "flush driver: batches released");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
