mod auth;
mod config;
mod dto;
mod error;
mod link;
mod routes;
mod state;

use std::sync::Arc;

use cm_fleet::{FileConfigSource, RetryScheduler, ServerManager};
use registry_api::RegistryClient;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    // Authoritative server records
    let registry = RegistryClient::new(
        config.registry_api_url.clone(),
        config.registry_api_token.clone(),
    );
    tracing::info!(url = %registry.base_url(), "registry client ready");

    // Command delivery
    let scheduler = Arc::new(RetryScheduler::new(config.retry_policy()));
    let retry_worker = scheduler.spawn();

    // Fleet
    let source = Arc::new(FileConfigSource::new(&config.fleet_config_path));
    let manager = ServerManager::new(
        source,
        scheduler.clone(),
        Arc::new(registry),
        config.settings(),
    );
    manager.reload().expect("failed to load fleet config");

    let state = AppState {
        manager: manager.clone(),
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting core manager");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    manager.shutdown();
    let _ = retry_worker.await;
    tracing::info!("core manager stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
