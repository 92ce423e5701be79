//! Control relay broker.
//!
//! Run with: PASS=secret cargo run -p control-relay-server
//!
//! Agents and admins connect over WebSocket to ws://localhost:1026/.

use clap::Parser;
use control_relay_server::config::RelayConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::parse();

    if let Err(e) = control_relay_server::run(config).await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
