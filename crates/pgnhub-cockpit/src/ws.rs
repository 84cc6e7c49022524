//! WebSocket bridge between the [`BroadcastHub`] and one client.
//!
//! Every client receives every broadcast event. `subscribe` to
//! [`STATUS_SUBSCRIPTION`] only asks for an immediate status snapshot;
//! other subscriptions and `unsubscribe` are accepted and ignored.
//!
//! [`BroadcastHub`]: pgnhub_middleware::BroadcastHub

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pgnhub_runtime::SessionHandle;
use pgnhub_types::BroadcastMessage;
use pgnhub_types::broadcast::events;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The subscription that answers with a status snapshot.
pub const STATUS_SUBSCRIPTION: &str = "status";

/// A command sent upstream by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Subscribe { subscription: String },
    Unsubscribe { subscription: String },
}

impl ClientCommand {
    /// Parse one text frame. Anything unrecognised yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

pub async fn upgrade(ws: WebSocketUpgrade, State(session): State<SessionHandle>) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, session))
}

async fn bridge(socket: WebSocket, session: SessionHandle) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut sub = session.subscribe();
    let client = sub.id();
    info!(client, "real-time client connected");

    let greeting = BroadcastMessage::new(events::CONNECTION).with_data(json!({
        "clientId": Uuid::new_v4().to_string(),
        "message": "Connected to pgnhub",
    }));
    if !send(&mut ws_tx, &greeting).await {
        return;
    }

    loop {
        tokio::select! {
            // ── Downstream: hub → client ──────────────────────────────────
            outgoing = sub.recv() => {
                let Some(message) = outgoing else { break };
                if !send(&mut ws_tx, &message).await {
                    break;
                }
            }
            // ── Upstream: client → session ────────────────────────────────
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match ClientCommand::parse(text.as_str()) {
                        Some(ClientCommand::Subscribe { subscription })
                            if subscription == STATUS_SUBSCRIPTION =>
                        {
                            match session.status().await {
                                Ok(snapshot) => {
                                    session.hub().send_to(client, snapshot.to_broadcast());
                                }
                                Err(e) => warn!(client, error = %e, "status snapshot unavailable"),
                            }
                        }
                        Some(command) => debug!(client, ?command, "subscription has no effect"),
                        None => debug!(client, "ignoring unrecognised client message"),
                    },
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    info!(client, "real-time client disconnected");
}

/// Write one envelope. Returns `false` once the socket is gone.
async fn send(ws_tx: &mut SplitSink<WebSocket, Message>, message: &BroadcastMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, event = %message.event, "dropping unserializable event");
            true
        }
    }
}
