//! The Transport Adapter contract.
//!
//! The orchestrator never talks to a serial port or socket directly. It
//! builds one [`TransportAdapter`] per connect attempt and listens to the
//! [`AdapterSignal`]s the adapter pushes through its [`EventSink`].
//!
//! # Contract
//!
//! * `connect` spawns the adapter's I/O task and returns. Readiness is
//!   reported later as [`AdapterEvent::Connected`], failure as
//!   [`AdapterEvent::Error`] followed by [`AdapterEvent::Disconnected`].
//! * Every inbound frame is one [`AdapterEvent::RawData`] line.
//! * Exactly one [`AdapterEvent::Disconnected`] is emitted per `connect`.
//! * `disconnect` is idempotent, releases the OS handles, and silences the
//!   sink so nothing is emitted afterwards.
//! * Adapters never retry. An adapter is single-use and is dropped after
//!   its one connect/disconnect cycle.
//!
//! Every signal carries the `generation` of the connect attempt that
//! produced it, so the orchestrator can drop late events from an adapter it
//! has already superseded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pgnhub_types::{AuthStatus, ConnectionProfile, HubError, PgnMessage, TransportFault};
use serde_json::Value;
use tokio::sync::mpsc;

/// What an adapter reports.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Connected,
    /// One inbound line, delimiter stripped.
    RawData(String),
    /// A SignalK delta object.
    Delta(Value),
    /// Authentication status changed.
    Auth(AuthStatus),
    /// I/O fault. Terminal faults are followed by `Disconnected`.
    Error(TransportFault),
    Disconnected,
}

/// An [`AdapterEvent`] tagged with the connect attempt it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSignal {
    pub generation: u64,
    pub event: AdapterEvent,
}

/// Sending half handed to an adapter on `connect`.
///
/// Cloneable so the I/O task and the adapter can both hold one. Enforces
/// the single terminal event and the post-disconnect silence.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<AdapterSignal>,
    finished: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<AdapterSignal>) -> Self {
        Self {
            generation,
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Convenience constructor for tests and one-off callers.
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<AdapterSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the terminal event has already been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn emit(&self, event: AdapterEvent) {
        if self.is_finished() {
            return;
        }
        // A closed receiver means the orchestrator is gone; nothing to do.
        let _ = self.tx.send(AdapterSignal {
            generation: self.generation,
            event,
        });
    }

    pub fn connected(&self) {
        self.emit(AdapterEvent::Connected);
    }

    pub fn raw(&self, line: impl Into<String>) {
        self.emit(AdapterEvent::RawData(line.into()));
    }

    pub fn delta(&self, delta: Value) {
        self.emit(AdapterEvent::Delta(delta));
    }

    pub fn auth(&self, status: AuthStatus) {
        self.emit(AdapterEvent::Auth(status));
    }

    pub fn error(&self, fault: TransportFault) {
        self.emit(AdapterEvent::Error(fault));
    }

    /// Emit the terminal event. Later calls and all other events are dropped.
    pub fn disconnected(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(AdapterSignal {
            generation: self.generation,
            event: AdapterEvent::Disconnected,
        });
    }

    /// Report a fatal fault and finish.
    pub fn fail(&self, fault: TransportFault) {
        self.error(fault);
        self.disconnected();
    }
}

/// Every transport kind implements this trait.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Transport kind, as in the profile's `type`.
    fn kind(&self) -> &'static str;

    /// Spawn the I/O task. Fails only when the adapter was already used.
    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError>;

    /// Stop I/O and release handles. Safe to call more than once.
    async fn disconnect(&mut self);

    /// Put one message on the wire.
    async fn send(&self, msg: &PgnMessage) -> Result<(), HubError> {
        let _ = msg;
        Err(HubError::Unsupported(format!(
            "{} connections are receive-only",
            self.kind()
        )))
    }

    /// Current authentication status, for adapters that authenticate.
    fn auth_status(&self) -> Option<AuthStatus> {
        None
    }
}

/// Error returned by `connect` on an adapter that has already been used.
pub(crate) fn already_used(kind: &str) -> HubError {
    HubError::Transport(format!("{kind} adapter is single-use and was already connected"))
}

/// Build a fresh adapter for `profile`.
pub fn build_adapter(profile: &ConnectionProfile) -> Result<Box<dyn TransportAdapter>, HubError> {
    profile.validate()?;
    crate::transports::for_config(&profile.transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_is_emitted_once_and_silences_sink() {
        let (sink, mut rx) = EventSink::channel(7);
        sink.connected();
        sink.disconnected();
        sink.disconnected();
        sink.raw("late");

        assert_eq!(rx.try_recv().unwrap().event, AdapterEvent::Connected);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.generation, 7);
        assert_eq!(last.event, AdapterEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_terminal_state() {
        let (sink, mut rx) = EventSink::channel(1);
        let task_side = sink.clone();
        task_side.fail(TransportFault::new("boom"));
        sink.disconnected();
        assert!(matches!(rx.try_recv().unwrap().event, AdapterEvent::Error(_)));
        assert_eq!(rx.try_recv().unwrap().event, AdapterEvent::Disconnected);
        assert!(rx.try_recv().is_err());
        assert!(sink.is_finished());
    }

    #[test]
    fn build_adapter_rejects_invalid_profile() {
        let profile: ConnectionProfile =
            serde_json::from_str(r#"{"id":"x","name":"X","type":"can-bus"}"#).unwrap();
        assert!(matches!(
            build_adapter(&profile),
            Err(HubError::Validation { .. })
        ));
    }
}
