//! End-to-end tests: real WebSocket clients against an in-process relay.

use std::{net::SocketAddr, time::Duration};

use axum::http::StatusCode;
use control_relay_server::build_router;
use control_relay_transport::{Broker, BrokerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures::stream::SplitStream<WsStream>;

const SECRET: &str = "test-secret";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn test_broker(intro_timeout: Duration) -> Broker {
    Broker::new(BrokerConfig::new(SECRET).with_intro_timeout(intro_timeout))
}

/// Serve the relay on an ephemeral port.
async fn spawn_relay(broker: Broker) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = build_router(broker, "/");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

struct Client {
    tx: WsTx,
    rx: WsRx,
    id: String,
}

impl Client {
    /// Connect and read the broker-assigned id.
    async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
        let (tx, rx) = stream.split();
        let mut client = Self { tx, rx, id: String::new() };
        let hello = client.recv().await?;
        anyhow::ensure!(hello["type"] == "id", "expected id message, got {hello}");
        client.id = hello["id"].as_str().unwrap_or_default().to_owned();
        Ok(client)
    }

    async fn admin(addr: SocketAddr) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(&json!({"type": "intro", "auth": SECRET})).await?;
        let resp = client.recv().await?;
        anyhow::ensure!(resp == json!({"type": "auth", "success": true}), "auth failed: {resp}");
        Ok(client)
    }

    async fn agent(addr: SocketAddr, id: &str, vol: f64, bal: f64) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        client
            .send(&json!({
                "type": "intro", "id": id, "disp": "Mixer",
                "elements": [
                    {"type": "action", "name": "mute", "disp": "Mute"},
                    {"type": "slider", "name": "vol", "disp": "Volume", "min": 0, "max": 1, "step": 0.01, "val": vol},
                    {"type": "slider", "name": "bal", "disp": "Balance", "min": -1, "max": 1, "val": bal},
                ],
            }))
            .await?;
        let confirm = client.recv().await?;
        anyhow::ensure!(confirm == json!({"type": "id", "id": id}), "expected id confirmation: {confirm}");
        Ok(client)
    }

    async fn send(&mut self, value: &Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(value)?;
        self.tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!("ws send: {e}"))
    }

    /// Next JSON message, skipping control frames.
    async fn recv(&mut self) -> anyhow::Result<Value> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
                .await
                .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
                .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
                .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
            match msg {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                other => anyhow::bail!("expected Text message, got {other:?}"),
            }
        }
    }

    /// Assert nothing arrives for a short while.
    async fn expect_quiet(&mut self) -> anyhow::Result<()> {
        match tokio::time::timeout(QUIET, self.rx.next()).await {
            Err(_) => Ok(()),
            Ok(msg) => anyhow::bail!("expected silence, got {msg:?}"),
        }
    }

    /// Read until the broker closes the socket; returns the close code if one was sent.
    async fn expect_close(&mut self) -> anyhow::Result<Option<u16>> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
                .await
                .map_err(|_| anyhow::anyhow!("socket was not closed"))?;
            match next {
                Some(Ok(WsMessage::Close(frame))) => return Ok(frame.map(|f| u16::from(f.code))),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    async fn hang_up(mut self) -> anyhow::Result<()> {
        self.tx.send(WsMessage::Close(None)).await.ok();
        // Drain until the server acknowledges.
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(RECV_TIMEOUT, self.rx.next()).await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
        }
        Ok(())
    }
}

// -- Handshake ----------------------------------------------------------------

#[tokio::test]
async fn correct_secret_authenticates() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::connect(addr).await?;
    assert!(!admin.id.is_empty());

    admin.send(&json!({"type": "intro", "auth": SECRET})).await?;
    assert_eq!(admin.recv().await?, json!({"type": "auth", "success": true}));
    Ok(())
}

#[tokio::test]
async fn wrong_secret_keeps_channel_usable() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut client = Client::connect(addr).await?;

    client.send(&json!({"type": "intro", "auth": "wrong"})).await?;
    assert_eq!(client.recv().await?, json!({"type": "auth", "success": false}));

    client.send(&json!({"type": "intro", "auth": SECRET})).await?;
    assert_eq!(client.recv().await?, json!({"type": "auth", "success": true}));
    Ok(())
}

#[tokio::test]
async fn failed_auth_is_not_timed_out() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_millis(150))).await?;
    let mut client = Client::connect(addr).await?;

    client.send(&json!({"type": "intro", "auth": "wrong"})).await?;
    assert_eq!(client.recv().await?, json!({"type": "auth", "success": false}));
    tokio::time::sleep(Duration::from_millis(400)).await;

    client.send(&json!({"type": "intro", "auth": SECRET})).await?;
    assert_eq!(client.recv().await?, json!({"type": "auth", "success": true}));
    Ok(())
}

#[tokio::test]
async fn silent_connection_is_closed() -> anyhow::Result<()> {
    let broker = test_broker(Duration::from_millis(150));
    let registry = std::sync::Arc::clone(broker.registry());
    let addr = spawn_relay(broker).await?;

    let mut client = Client::connect(addr).await?;
    client.send(&json!({"type": "upd", "name": "vol", "val": 1})).await?;
    assert_eq!(client.expect_close().await?, Some(4000));
    assert_eq!(registry.agent_count().await, 0);
    assert_eq!(registry.admin_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_element_names_reject_intro() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::admin(addr).await?;

    let mut agent = Client::connect(addr).await?;
    agent
        .send(&json!({
            "type": "intro", "label": "Twins",
            "elements": [
                {"type": "slider", "name": "vol", "label": "L", "min": 0, "max": 1, "value": 0},
                {"type": "slider", "name": "vol", "label": "R", "min": 0, "max": 1, "value": 0},
            ],
        }))
        .await?;
    assert_eq!(agent.expect_close().await?, Some(4002));
    admin.expect_quiet().await?;
    Ok(())
}

// -- Routing ------------------------------------------------------------------

#[tokio::test]
async fn agent_lifecycle_is_broadcast_in_order() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::admin(addr).await?;
    let mut agent = Client::agent(addr, "desk", 0.5, 0.0).await?;

    let on = admin.recv().await?;
    assert_eq!(on["type"], "agent-on");
    assert_eq!(on["id"], "desk");
    assert_eq!(on["label"], "Mixer");
    let names: Vec<_> = on["elements"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|el| el["name"].clone())
        .collect();
    assert_eq!(names, [json!("mute"), json!("vol"), json!("bal")]);
    assert_eq!(on["elements"][2]["step"], "continuous");

    agent.send(&json!({"type": "upd", "name": "vol", "val": 0.75})).await?;
    let upd = admin.recv().await?;
    assert_eq!(upd, json!({"type": "agent-upd", "id": "desk", "name": "vol", "val": 0.75}));

    agent.send(&json!({"type": "done", "ts": 3, "name": "mute"})).await?;
    assert_eq!(
        admin.recv().await?,
        json!({"type": "agent-done", "id": "desk", "ts": 3, "name": "mute"})
    );

    agent.hang_up().await?;
    assert_eq!(admin.recv().await?, json!({"type": "agent-off", "id": "desk"}));
    Ok(())
}

#[tokio::test]
async fn late_admin_sees_current_values() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut agent = Client::agent(addr, "desk", 0.5, 0.0).await?;
    let mut first = Client::admin(addr).await?;
    first.recv().await?;

    agent.send(&json!({"type": "upd", "key": "bal", "val": "-0.5"})).await?;
    assert_eq!(first.recv().await?["val"], -0.5);

    let mut late = Client::admin(addr).await?;
    let on = late.recv().await?;
    assert_eq!(on["type"], "agent-on");
    assert_eq!(on["elements"][2]["value"], -0.5);
    Ok(())
}

#[tokio::test]
async fn set_is_forwarded_exactly_once() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut agent = Client::agent(addr, "X", 0.1, 0.0).await?;
    let mut admin = Client::admin(addr).await?;
    let mut observer = Client::admin(addr).await?;
    admin.recv().await?;
    observer.recv().await?;

    admin
        .send(&json!({"type": "set", "id": "X", "ts": 42, "name": "vol", "val": 0.5}))
        .await?;
    assert_eq!(
        agent.recv().await?,
        json!({"type": "set", "ts": 42, "name": "vol", "val": 0.5})
    );
    agent.expect_quiet().await?;
    observer.expect_quiet().await?;
    admin.expect_quiet().await?;

    agent
        .send(&json!({"type": "upd", "ts": 42, "name": "vol", "val": 0.5}))
        .await?;
    let expected = json!({"type": "agent-upd", "id": "X", "ts": 42, "name": "vol", "val": 0.5});
    assert_eq!(admin.recv().await?, expected);
    assert_eq!(observer.recv().await?, expected);
    Ok(())
}

#[tokio::test]
async fn set_to_unknown_agent_is_harmless() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::admin(addr).await?;

    admin
        .send(&json!({"type": "set", "id": "nobody", "ts": 1, "name": "vol", "val": 0.5}))
        .await?;
    let err = admin.recv().await?;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "unknown-agent");

    // Still routed afterwards.
    let mut agent = Client::agent(addr, "later", 0.0, 0.0).await?;
    assert_eq!(admin.recv().await?["type"], "agent-on");
    admin.send(&json!({"type": "act", "id": "later", "name": "mute"})).await?;
    assert_eq!(agent.recv().await?, json!({"type": "act", "name": "mute"}));
    Ok(())
}

#[tokio::test]
async fn replacement_is_seamless() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::admin(addr).await?;
    let mut original = Client::agent(addr, "studio", 0.2, 0.0).await?;
    assert_eq!(admin.recv().await?["type"], "agent-on");

    let mut successor = Client::agent(addr, "studio", 0.9, 0.3).await?;
    assert_eq!(original.expect_close().await?, Some(4001));

    let first = admin.recv().await?;
    let second = admin.recv().await?;
    assert_eq!(first, json!({"type": "agent-upd", "id": "studio", "ts": "", "name": "vol", "val": 0.9}));
    assert_eq!(second, json!({"type": "agent-upd", "id": "studio", "ts": "", "name": "bal", "val": 0.3}));
    admin.expect_quiet().await?;

    // Commands now reach the successor.
    admin.send(&json!({"type": "act", "id": "studio", "ts": 1, "name": "mute"})).await?;
    assert_eq!(successor.recv().await?, json!({"type": "act", "ts": 1, "name": "mute"}));
    Ok(())
}

#[tokio::test]
async fn unintroduced_close_is_not_announced() -> anyhow::Result<()> {
    let addr = spawn_relay(test_broker(Duration::from_secs(5))).await?;
    let mut admin = Client::admin(addr).await?;

    let pending = Client::connect(addr).await?;
    pending.hang_up().await?;
    admin.expect_quiet().await?;
    Ok(())
}

// -- Health -------------------------------------------------------------------

#[tokio::test]
async fn health_reports_session_counts() -> anyhow::Result<()> {
    let broker = test_broker(Duration::from_secs(5));
    let server = axum_test::TestServer::new(build_router(broker, "/")).expect("create test server");

    let resp = server.get("/health").await;
    resp.assert_status(StatusCode::OK);
    let body: Value = resp.json();
    assert_eq!(body, json!({"status": "running", "agents": 0, "admins": 0}));
    Ok(())
}
