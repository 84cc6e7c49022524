//! `pgnhub-cockpit` – the control surface and real-time channel of the hub.
//!
//! Boots an HTTP + WebSocket server (default port `3000`) in front of a
//! running [`SessionHandle`]:
//!
//! 1. **Controls** the session over a JSON REST API under `/api`: server
//!    settings, connection profiles, activation, restart, recording and
//!    message submission. Every response is `{ "success": bool, ... }`.
//!
//! 2. **Bridges** the [`BroadcastHub`] to every connected client over a
//!    persistent WebSocket at `/ws`, so `nmea:*`, `canboatjs:*`,
//!    `signalk:*` and `recording:*` events stream out in real time.
//!
//! 3. **Accepts** upstream commands from the client: `subscribe` /
//!    `unsubscribe` with a named subscription. Subscribing to `status`
//!    answers with a synthesized status snapshot.
//!
//! # Usage
//!
//! ```rust,no_run
//! use pgnhub_cockpit::CockpitServer;
//! # async fn demo(handle: pgnhub_runtime::SessionHandle) {
//! CockpitServer::new(handle)
//!     .with_port(3000)
//!     .run()
//!     .await
//!     .expect("cockpit server failed");
//! # }
//! ```
//!
//! [`SessionHandle`]: pgnhub_runtime::SessionHandle
//! [`BroadcastHub`]: pgnhub_middleware::BroadcastHub

pub mod api;
pub mod server;
pub mod ws;

pub use api::ApiError;
pub use server::{CockpitServer, router};
pub use ws::ClientCommand;
