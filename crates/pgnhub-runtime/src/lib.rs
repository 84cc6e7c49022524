//! `pgnhub-runtime` – the session orchestrator.
//!
//! Composes the transports, the broadcast hub and the recorder into one
//! running session that owns "which profile is active".
//!
//! # Modules
//!
//! - [`session`] – [`Session`] and its [`SessionHandle`]: a single task
//!   that owns all session state and answers commands over a channel.
//! - [`supervisor`] – [`Supervisor`], the connection state machine with
//!   grace-period scheduling and generation-based cancellation.
//! - [`profile_store`] – [`ProfileStore`], the persisted TOML document of
//!   server settings and connection profiles.
//! - [`submit`] – decoding (and optionally transmitting) caller-supplied
//!   message batches.
//! - [`telemetry`] – [`init_tracing`]: `tracing-subscriber` set-up with an
//!   optional OTLP span exporter.

pub mod profile_store;
pub mod session;
pub mod submit;
pub mod supervisor;
pub mod telemetry;

pub use profile_store::{ConnectionsConfig, DEFAULT_PORT, HubConfig, ProfileStore, ServerConfig};
pub use session::{CodecFactory, Session, SessionHandle, SessionSettings, StatusSnapshot};
pub use submit::{SubmitReport, SubmitRequest};
pub use supervisor::{Supervisor, Transition};
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
