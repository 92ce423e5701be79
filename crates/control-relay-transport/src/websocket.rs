//! WebSocket transport for the broker.

use std::{future, time::Duration};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
};
use control_relay_core::{PeerOutbox, ServerMessage};
use futures::{SinkExt, StreamExt, stream::SplitSink};

use crate::Broker;

/// How long a broker-initiated close may spend flushing queued messages.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler with a [`Broker`] as state.
pub async fn ws_handler(ws: WebSocketUpgrade, State(broker): State<Broker>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (sender, receiver) = socket.split();
    let (peer, outbox) = broker.open_peer();

    // Spawn task to forward queued messages to the WebSocket
    let mut send_task = tokio::spawn(write_outbox(sender, outbox));

    let conn = peer.conn();
    let inbound = receiver
        .inspect(move |msg| {
            if let Err(e) = msg {
                tracing::debug!(%conn, "WebSocket error: {e}");
            }
        })
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => String::from_utf8(data.to_vec()).ok(),
                _ => None,
            })
        });

    broker.serve(peer.clone(), inbound).await;

    if peer.is_closed() {
        // Let the writer flush and send the close frame.
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
            send_task.abort();
        }
    } else {
        send_task.abort();
    }
}

async fn write_outbox(mut sender: SplitSink<WebSocket, Message>, mut outbox: PeerOutbox) {
    let close = outbox.close_signal();
    loop {
        tokio::select! {
            biased;
            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                if write_message(&mut sender, &msg).await.is_err() {
                    break;
                }
            }
            reason = close.closed() => {
                while let Some(msg) = outbox.try_recv() {
                    if write_message(&mut sender, &msg).await.is_err() {
                        return;
                    }
                }
                let frame = CloseFrame {
                    code: reason.code(),
                    reason: reason.to_string().into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

async fn write_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

/// Create WebSocket router serving the broker on `path`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(broker, "/"));
/// ```
#[must_use]
pub fn create_ws_router(broker: Broker, path: &str) -> axum::Router {
    axum::Router::new()
        .route(path, axum::routing::get(ws_handler))
        .with_state(broker)
}
