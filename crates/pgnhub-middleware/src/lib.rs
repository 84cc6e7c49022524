//! `pgnhub-middleware` – the plumbing between the bus and the hub.
//!
//! Moves lines and messages between transports, the codec and real-time
//! subscribers without caring what any individual PGN means.
//!
//! # Modules
//!
//! - [`bus`] – [`BroadcastHub`], best-effort fan-out to subscriber
//!   connections keyed by id.
//! - [`adapter`] – the [`TransportAdapter`] contract, [`EventSink`] and the
//!   adapter factory.
//! - [`transports`] – serial, TCP, UDP, CAN bus, SignalK and file playback
//!   adapters.
//! - [`signalk_auth`] – SignalK login, renewal and logout.
//! - [`framing`] – byte stream and datagram line splitting.
//! - [`can`] – 29-bit identifiers, fast packets, address claim.
//! - [`wire`] – per-format serializers and line parsers.
//! - [`codec`] – the [`PgnCodec`] seam and the bundled [`FrameCodec`].

pub mod adapter;
pub mod bus;
pub mod can;
pub mod codec;
pub mod framing;
pub mod signalk_auth;
pub mod transports;
pub mod wire;

pub use adapter::{AdapterEvent, AdapterSignal, EventSink, TransportAdapter, build_adapter};
pub use bus::{BroadcastHub, PublishReport, SubscriberId, Subscription};
pub use codec::{FrameCodec, PgnCodec};
pub use signalk_auth::{AuthState, AuthTokenManager, Credentials};
