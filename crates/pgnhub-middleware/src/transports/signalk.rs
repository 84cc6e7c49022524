//! SignalK streaming client.
//!
//! Connects to a SignalK server's WebSocket stream, logs in when
//! credentials are configured, and subscribes to every path of the own
//! vessel. Delta objects are forwarded as [`AdapterEvent::Delta`]; the
//! connection is receive-only.
//!
//! [`AdapterEvent::Delta`]: crate::adapter::AdapterEvent::Delta

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pgnhub_types::{AuthStatus, HubError, TransportFault};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{EventSink, TransportAdapter, already_used};
use crate::signalk_auth::{AuthOutcome, AuthTokenManager, Credentials, LOGIN_TIMEOUT};

/// Subscription sent once the stream is usable.
pub fn subscribe_frame() -> Value {
    json!({
        "context": "vessels.self",
        "subscribe": [{ "path": "*", "period": 1000 }],
    })
}

type SharedAuth = Arc<Mutex<AuthTokenManager>>;

fn lock(auth: &SharedAuth) -> MutexGuard<'_, AuthTokenManager> {
    auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SignalkAdapter {
    url: String,
    auth: SharedAuth,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    sink: Option<EventSink>,
}

impl SignalkAdapter {
    pub fn new(url: String, credentials: Option<Credentials>) -> Self {
        Self {
            url,
            auth: Arc::new(Mutex::new(AuthTokenManager::new(credentials))),
            cancel: CancellationToken::new(),
            task: None,
            sink: None,
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(url: String, auth: SharedAuth, cancel: CancellationToken, sink: EventSink) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };
    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(%url, error = %e, "signalk connect failed");
            sink.fail(TransportFault::from_error(&e));
            return;
        }
    };
    info!(%url, "signalk stream connected");
    sink.connected();

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut subscribed = false;
    let mut login_deadline = None;

    let login = lock(&auth).begin_login();
    let first = match login {
        Some(frame) => {
            login_deadline = Some(Instant::now() + LOGIN_TIMEOUT);
            frame
        }
        None => {
            subscribed = true;
            subscribe_frame()
        }
    };
    if let Err(e) = ws_tx.send(Message::Text(first.to_string().into())).await {
        sink.fail(TransportFault::from_error(&e));
        return;
    }

    loop {
        let renew_at = lock(&auth)
            .renew_in(Utc::now())
            .map(|delay| Instant::now() + delay);
        let mut outgoing: Vec<Value> = Vec::new();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wait_until(login_deadline) => {
                login_deadline = None;
                if let Some(AuthOutcome::Failed(reason)) = lock(&auth).expire_pending() {
                    warn!(%url, %reason, "signalk login failed, continuing anonymously");
                }
                sink.auth(lock(&auth).status(Utc::now()));
                if !subscribed {
                    subscribed = true;
                    outgoing.push(subscribe_frame());
                }
            }
            _ = wait_until(renew_at) => {
                debug!(%url, "renewing signalk token");
                if let Some(frame) = lock(&auth).begin_login() {
                    login_deadline = Some(Instant::now() + LOGIN_TIMEOUT);
                    outgoing.push(frame);
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        debug!(%url, "ignoring non-JSON signalk frame");
                        continue;
                    };
                    let outcome = lock(&auth).handle_response(&frame, Utc::now());
                    match outcome {
                        Some(outcome) => {
                            login_deadline = None;
                            match outcome {
                                AuthOutcome::Authenticated => info!(%url, "signalk login succeeded"),
                                AuthOutcome::Failed(reason) => {
                                    warn!(%url, %reason, "signalk login failed, continuing anonymously");
                                }
                            }
                            sink.auth(lock(&auth).status(Utc::now()));
                            if !subscribed {
                                subscribed = true;
                                outgoing.push(subscribe_frame());
                            }
                        }
                        None if frame.get("updates").is_some() => sink.delta(frame),
                        None => debug!(%url, "ignoring signalk frame without updates"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(%url, "signalk server closed the stream");
                    break;
                }
                Some(Err(e)) => {
                    warn!(%url, error = %e, "signalk stream failed");
                    sink.error(TransportFault::from_error(&e));
                    break;
                }
                Some(Ok(_)) => {}
            },
        }

        for frame in outgoing {
            if let Err(e) = ws_tx.send(Message::Text(frame.to_string().into())).await {
                warn!(%url, error = %e, "signalk send failed");
            }
        }
    }

    let logout = lock(&auth).logout();
    if let Some(frame) = logout {
        if let Err(e) = ws_tx.send(Message::Text(frame.to_string().into())).await {
            debug!(%url, error = %e, "logout not delivered");
        }
        sink.auth(lock(&auth).status(Utc::now()));
    }
    let _ = ws_tx.close().await;
    sink.disconnected();
}

#[async_trait]
impl TransportAdapter for SignalkAdapter {
    fn kind(&self) -> &'static str {
        "signalk"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        self.task = Some(tokio::spawn(run(
            self.url.clone(),
            self.auth.clone(),
            self.cancel.clone(),
            sink.clone(),
        )));
        self.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(url = %self.url, error = %e, "signalk task ended abnormally");
        }
        // The session dies with the socket even if the task never ran.
        lock(&self.auth).logout();
        if let Some(sink) = &self.sink {
            sink.disconnected();
        }
    }

    fn auth_status(&self) -> Option<AuthStatus> {
        Some(lock(&self.auth).status(Utc::now()))
    }
}
