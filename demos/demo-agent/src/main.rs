//! Demo agent for the control relay.
//!
//! Run with: cargo run -p demo-agent -- --url ws://localhost:1026/
//!
//! Exposes two actions and two sliders. Reconnects after a second whenever the
//! broker goes away, keeping its id and slider values, and nudges the stepped
//! slider every few seconds to show unsolicited updates.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use control_relay_core::{Element, ServerMessage, Step};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const NUDGE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "demo-agent", about = "Sample agent for the control relay")]
struct Args {
    /// Broker WebSocket URL.
    #[arg(long, default_value = "ws://localhost:1026/", env = "RELAY_URL")]
    url: String,

    /// Id declared in `intro`, kept across reconnects.
    #[arg(long, default_value = "demo-agent")]
    id: String,

    /// Display label.
    #[arg(long, default_value = "Test Client")]
    label: String,
}

/// Values that survive reconnects.
#[derive(Debug)]
struct Controls {
    s1: f64,
    s2: f64,
}

impl Controls {
    fn elements(&self) -> Vec<Element> {
        vec![
            Element::action("a1", "An action"),
            Element::action("a2", "Another action"),
            Element::slider("s1", "A slider", -1.0, 1.0, Step::Continuous, self.s1),
            Element::slider("s2", "Another slider", 0.0, 10.0, Step::Fixed(1.0), self.s2),
        ]
    }

    /// Handle a forwarded command; returns the reply to send, if any.
    fn apply(&mut self, msg: ServerMessage) -> Option<Value> {
        match msg {
            ServerMessage::Act { ts, name } => {
                tracing::info!(%name, "action triggered");
                Some(json!({"type": "done", "ts": ts, "name": name}))
            }
            ServerMessage::Set { ts, name, val } => {
                match name.as_str() {
                    "s1" => self.s1 = val,
                    "s2" => self.s2 = val,
                    _ => {
                        tracing::warn!(%name, "set for unknown slider");
                        return None;
                    }
                }
                tracing::info!(%name, val, "slider set");
                Some(json!({"type": "upd", "ts": ts, "name": name, "val": val}))
            }
            other => {
                tracing::debug!(?other, "ignoring message");
                None
            }
        }
    }

    fn nudge(&mut self) -> Value {
        self.s2 = (self.s2 + 1.0) % 11.0;
        json!({"type": "upd", "name": "s2", "val": self.s2})
    }
}

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

    let args = Args::parse();
    let mut controls = Controls { s1: 0.3, s2: 0.0 };

    loop {
        match run_once(&args, &mut controls).await {
            Ok(()) => tracing::info!("disconnected from broker"),
            Err(e) => tracing::warn!("connection failed: {e:#}"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// One connection, from handshake until the socket closes.
async fn run_once(args: &Args, controls: &mut Controls) -> anyhow::Result<()> {
    let (stream, _) = tokio_tungstenite::connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut tx, mut rx) = stream.split();
    let mut nudge = tokio::time::interval(NUDGE_INTERVAL);
    nudge.tick().await;
    let mut introduced = false;

    loop {
        let reply = tokio::select! {
            frame = rx.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let text = match frame.context("receive failed")? {
                    Message::Text(text) => text,
                    Message::Close(frame) => {
                        tracing::info!(?frame, "broker closed the connection");
                        return Ok(());
                    }
                    _ => continue,
                };
                let msg: ServerMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("unreadable message: {e}");
                        continue;
                    }
                };
                match msg {
                    ServerMessage::Id { id } if !introduced => {
                        introduced = true;
                        tracing::info!(assigned = %id, declared = %args.id, "connected");
                        Some(json!({
                            "type": "intro",
                            "id": args.id,
                            "label": args.label,
                            "elements": controls.elements(),
                        }))
                    }
                    ServerMessage::Id { id } => {
                        tracing::debug!(%id, "id confirmed");
                        None
                    }
                    other => controls.apply(other),
                }
            }
            _ = nudge.tick(), if introduced => Some(controls.nudge()),
        };

        if let Some(reply) = reply {
            tx.send(Message::Text(reply.to_string().into()))
                .await
                .context("send failed")?;
        }
    }
}
