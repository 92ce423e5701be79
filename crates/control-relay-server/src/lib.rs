//! Control relay server: wires the broker into an axum application.

pub mod config;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use control_relay_transport::{Broker, websocket::create_ws_router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::RelayConfig;

/// Build the application router: the WebSocket endpoint plus `/health`.
#[must_use]
pub fn build_router(broker: Broker, ws_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(broker.clone())
        .merge(create_ws_router(broker, ws_path))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(broker): State<Broker>) -> Json<Value> {
    let registry = broker.registry();
    Json(json!({
        "status": "running",
        "agents": registry.agent_count().await,
        "admins": registry.admin_count().await,
    }))
}

/// Serve until Ctrl-C.
///
/// # Errors
/// Returns error if the listener cannot be bound or the server fails.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let broker = Broker::new(config.broker_config());
    let app = build_router(broker, &config.path);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Running at http://{}/", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
