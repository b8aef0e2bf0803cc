// =============================================================================
// Grid/Hedge Decision Engine — Main Entry Point
// =============================================================================
//
// Bootstraps the HTTP transport (C8), loads persisted state (C10), and wires
// the read-model/control surface (C6) to the decision engine (C4). The
// engine itself is wholly synchronous; all concurrency here is ambient HTTP
// server plumbing, matching the teacher's split between its own async
// streaming loops and its core decision logic.
// =============================================================================

mod api;
mod app_state;
mod engine;
mod error;
mod hedge;
mod identity;
mod runtime_state;
mod settings;
mod side_engine;
mod state_store;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Grid/Hedge Decision Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let state_path = std::env::var("ENGINE_STATE_PATH").unwrap_or_else(|_| "state.json".into());
    let symbol = std::env::var("ENGINE_SYMBOL").unwrap_or_else(|_| "EURUSD".into());

    info!(%bind_addr, %state_path, %symbol, "configuration resolved");

    let state = Arc::new(AppState::new(state_path, symbol));

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.persist_now();
    warn!("shutdown signal handled, final state persisted, server stopped");
    Ok(())
}

/// Waits for Ctrl+C (or SIGTERM on unix) so the server can drain in-flight
/// requests before exiting; `main` persists once more after this resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("shutdown signal received, draining in-flight requests");
}
