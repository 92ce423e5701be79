//! Command-line and environment configuration.

use std::time::Duration;

use clap::Parser;
use control_relay_transport::BrokerConfig;

/// Configuration for the control relay server.
#[derive(Debug, Clone, Parser)]
#[command(name = "control-relay", version, about = "Relay commands between admins and remote agents")]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 1026, env = "PORT")]
    pub port: u16,

    /// Admin password expected in `intro.auth`.
    #[arg(long, env = "PASS", hide_env_values = true)]
    pub pass: String,

    /// Milliseconds a new connection has to introduce itself.
    #[arg(long, default_value_t = 5000, env = "INTRO_TIMEOUT_MS")]
    pub intro_timeout_ms: u64,

    /// Messages buffered per connection before further sends are dropped.
    #[arg(long, default_value_t = 256, env = "OUTBOX_CAPACITY")]
    pub outbox_capacity: usize,

    /// Route serving the WebSocket upgrade.
    #[arg(long, default_value = "/", env = "WS_PATH")]
    pub path: String,
}

impl RelayConfig {
    /// `host:port` to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Grace period for `intro`.
    #[must_use]
    pub const fn intro_timeout(&self) -> Duration {
        Duration::from_millis(self.intro_timeout_ms)
    }

    /// Broker settings derived from this config.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new(self.pass.clone())
            .with_intro_timeout(self.intro_timeout())
            .with_outbox_capacity(self.outbox_capacity)
    }
}
