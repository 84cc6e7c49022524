//! [`CockpitServer`] – HTTP + WebSocket server in front of a session.
//!
//! Listens on `0.0.0.0:3000` (configurable via [`CockpitServer::with_port`]).
//!
//! * `/api/...` → JSON control surface, see [`crate::api`].
//! * `/ws` → bidirectional bridge to the broadcast hub, see [`crate::ws`].

use axum::Router;
use axum::routing::{get, post};
use pgnhub_runtime::{DEFAULT_PORT, SessionHandle};
use pgnhub_types::HubError;
use tokio::net::TcpListener;
use tracing::info;

use crate::{api, ws};

/// Every route of the control surface, bound to `session`.
pub fn router(session: SessionHandle) -> Router {
    Router::new()
        .route("/api/config", get(api::get_config).put(api::put_config))
        .route(
            "/api/connections",
            get(api::list_connections).post(api::save_connection),
        )
        .route(
            "/api/connections/deactivate",
            post(api::deactivate_connection),
        )
        .route(
            "/api/connections/{id}",
            get(api::get_connection).delete(api::delete_connection),
        )
        .route(
            "/api/connections/{id}/activate",
            post(api::activate_connection),
        )
        .route("/api/restart", post(api::restart_connection))
        .route("/api/status", get(api::status))
        .route("/api/recording/status", get(api::recording_status))
        .route("/api/recording/start", post(api::start_recording))
        .route("/api/recording/stop", post(api::stop_recording))
        .route("/api/recording/files", get(api::list_recordings))
        .route(
            "/api/recording/files/{name}",
            get(api::download_recording).delete(api::delete_recording),
        )
        .route("/api/send", post(api::send))
        .route("/ws", get(ws::upgrade))
        .with_state(session)
}

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// HTTP + WebSocket server bound to one [`SessionHandle`].
pub struct CockpitServer {
    session: SessionHandle,
    port: u16,
}

impl CockpitServer {
    /// Create a server for `session` on the [`DEFAULT_PORT`].
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve until the listener fails.
    pub async fn run(self) -> Result<(), HubError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| HubError::Transport(format!("cannot bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HubError> {
        if let Ok(local) = listener.local_addr() {
            info!(%local, "cockpit listening");
        }
        axum::serve(listener, router(self.session))
            .await
            .map_err(|e| HubError::Transport(format!("cockpit server stopped: {e}")))
    }
}
