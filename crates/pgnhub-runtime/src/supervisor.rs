//! Connection state machine.
//!
//! ```text
//!  Idle ──schedule──▶ Connecting ──connected──▶ Connected
//!   ▲                    │                         │
//!   └──── error / disconnected / stop ─────────────┘
//! ```
//!
//! [`Supervisor`] owns the one live [`TransportAdapter`] and the process-wide
//! [`ConnectionState`]. A connect attempt is a cancellable task that sleeps
//! for the grace period and then posts its generation on the `due` channel;
//! the session task answers with [`Supervisor::connect_due`].
//!
//! Every schedule or stop bumps the generation. Signals and due notices
//! from an older generation are dropped, which is how a superseded adapter's
//! late `connected` is ignored.
//!
//! There is no retry. After an error the machine rests in `Idle` until the
//! next explicit schedule.

use std::time::Duration;

use pgnhub_middleware::{AdapterEvent, AdapterSignal, EventSink, TransportAdapter, build_adapter};
use pgnhub_types::{AuthStatus, ConnectionProfile, ConnectionState, LinkPhase};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What the session should publish after feeding the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Connected,
    Disconnected,
    /// Normalised reason, already stored in the state.
    Failed(String),
    Data(String),
    Delta(Value),
    Auth(AuthStatus),
}

/// Receiving ends the session task polls.
pub struct SupervisorInbox {
    pub signals: mpsc::UnboundedReceiver<AdapterSignal>,
    pub due: mpsc::UnboundedReceiver<u64>,
}

pub struct Supervisor {
    phase: LinkPhase,
    state: ConnectionState,
    generation: u64,
    adapter: Option<Box<dyn TransportAdapter>>,
    scheduled: Option<JoinHandle<()>>,
    auth: Option<AuthStatus>,
    signals: mpsc::UnboundedSender<AdapterSignal>,
    due: mpsc::UnboundedSender<u64>,
}

impl Supervisor {
    pub fn new() -> (Self, SupervisorInbox) {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (due_tx, due) = mpsc::unbounded_channel();
        let supervisor = Self {
            phase: LinkPhase::Idle,
            state: ConnectionState::idle(),
            generation: 0,
            adapter: None,
            scheduled: None,
            auth: None,
            signals: signals_tx,
            due: due_tx,
        };
        (supervisor, SupervisorInbox { signals, due })
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Authentication status of the current or last SignalK session.
    pub fn auth(&self) -> Option<AuthStatus> {
        self.adapter
            .as_ref()
            .and_then(|a| a.auth_status())
            .or_else(|| self.auth.clone())
    }

    pub fn adapter(&self) -> Option<&dyn TransportAdapter> {
        self.adapter.as_deref()
    }

    /// Tear down whatever is running and schedule a fresh connect after
    /// `delay`. `clear_error` is set for manual restarts.
    pub async fn schedule(&mut self, delay: Duration, clear_error: bool) -> Option<Transition> {
        let was_connected = self.state.is_connected;
        self.cancel_scheduled();
        self.teardown().await;
        self.generation += 1;
        if clear_error {
            self.state = self.state.cleared();
        }
        let transition = was_connected.then(|| {
            self.state = self.state.disconnected();
            Transition::Disconnected
        });
        self.phase = LinkPhase::Connecting;

        let generation = self.generation;
        let due = self.due.clone();
        self.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due.send(generation);
        }));
        info!(generation, delay_ms = delay.as_millis() as u64, "connect scheduled");
        transition
    }

    /// Whether a due notice for `generation` should still be acted on.
    pub fn is_due(&self, generation: u64) -> bool {
        generation == self.generation
            && self.phase == LinkPhase::Connecting
            && self.adapter.is_none()
    }

    /// Build an adapter for `profile` and start it.
    pub async fn connect_due(
        &mut self,
        generation: u64,
        profile: &ConnectionProfile,
    ) -> Option<Transition> {
        if !self.is_due(generation) {
            debug!(generation, current = self.generation, "stale connect notice dropped");
            return None;
        }
        self.scheduled = None;
        match build_adapter(profile) {
            Ok(adapter) => self.attach(adapter).await,
            Err(e) => {
                warn!(profile = %profile.id, error = %e, "cannot build adapter");
                Some(self.fail(e.to_string()))
            }
        }
    }

    async fn attach(&mut self, mut adapter: Box<dyn TransportAdapter>) -> Option<Transition> {
        let sink = EventSink::new(self.generation, self.signals.clone());
        if let Err(e) = adapter.connect(sink).await {
            adapter.disconnect().await;
            return Some(self.fail(e.to_string()));
        }
        info!(kind = adapter.kind(), generation = self.generation, "adapter started");
        self.auth = adapter.auth_status();
        self.adapter = Some(adapter);
        None
    }

    /// Cancel any pending or live connection and rest in `Idle`.
    pub async fn stop(&mut self) -> Option<Transition> {
        let active = self.phase != LinkPhase::Idle || self.state.is_connected;
        self.cancel_scheduled();
        self.generation += 1;
        self.phase = LinkPhase::Disconnecting;
        self.teardown().await;
        self.phase = LinkPhase::Idle;
        if !active {
            return None;
        }
        self.state = self.state.disconnected();
        info!(generation = self.generation, "connection stopped");
        Some(Transition::Disconnected)
    }

    /// Feed one adapter signal through the machine.
    pub fn on_signal(&mut self, signal: AdapterSignal) -> Option<Transition> {
        if signal.generation != self.generation || self.adapter.is_none() {
            trace!(generation = signal.generation, "stale adapter signal dropped");
            return None;
        }
        match signal.event {
            AdapterEvent::Connected => {
                if self.phase != LinkPhase::Connecting {
                    return None;
                }
                self.phase = LinkPhase::Connected;
                self.state = self.state.connected();
                info!(generation = self.generation, "connected");
                Some(Transition::Connected)
            }
            AdapterEvent::RawData(line) => Some(Transition::Data(line)),
            AdapterEvent::Delta(delta) => Some(Transition::Delta(delta)),
            AdapterEvent::Auth(status) => {
                self.auth = Some(status.clone());
                Some(Transition::Auth(status))
            }
            AdapterEvent::Error(fault) => {
                let reason = fault.normalized();
                warn!(error = %reason, "transport error; waiting for a manual restart");
                Some(self.fail(reason))
            }
            AdapterEvent::Disconnected => {
                self.phase = LinkPhase::Idle;
                self.state = self.state.disconnected();
                self.release();
                info!(generation = self.generation, "disconnected");
                Some(Transition::Disconnected)
            }
        }
    }

    fn fail(&mut self, reason: String) -> Transition {
        self.phase = LinkPhase::Idle;
        self.state = self.state.failed(reason.clone());
        self.release();
        Transition::Failed(reason)
    }

    fn cancel_scheduled(&mut self) {
        if let Some(task) = self.scheduled.take() {
            task.abort();
        }
    }

    /// Drop the adapter from inside a signal handler; its shutdown runs in
    /// the background.
    fn release(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            self.auth = self.auth.take().map(|_| AuthStatus::default());
            tokio::spawn(async move { adapter.disconnect().await });
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            debug!(kind = adapter.kind(), "tearing down adapter");
            adapter.disconnect().await;
            self.auth = self.auth.take().map(|_| AuthStatus::default());
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pgnhub_types::{HubError, NetworkProtocol, TransportConfig, TransportFault};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const GRACE: Duration = Duration::from_millis(10);

    #[derive(Default, Clone)]
    struct Spy {
        sink: Arc<Mutex<Option<EventSink>>>,
        disconnects: Arc<AtomicUsize>,
    }

    impl Spy {
        fn sink(&self) -> EventSink {
            self.sink.lock().unwrap().clone().expect("adapter was connected")
        }
    }

    struct FakeAdapter(Spy);

    #[async_trait]
    impl TransportAdapter for FakeAdapter {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
            *self.0.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
            if let Some(sink) = self.0.sink.lock().unwrap().as_ref() {
                sink.disconnected();
            }
        }
    }

    async fn start(sup: &mut Supervisor, inbox: &mut SupervisorInbox) -> Spy {
        sup.schedule(GRACE, false).await;
        let generation = inbox.due.recv().await.unwrap();
        assert!(sup.is_due(generation));
        let spy = Spy::default();
        assert!(sup.attach(Box::new(FakeAdapter(spy.clone()))).await.is_none());
        spy
    }

    async fn pump(sup: &mut Supervisor, inbox: &mut SupervisorInbox) -> Option<Transition> {
        let signal = inbox.signals.recv().await.unwrap();
        sup.on_signal(signal)
    }

    #[tokio::test]
    async fn connected_then_data_flows() {
        let (mut sup, mut inbox) = Supervisor::new();
        let spy = start(&mut sup, &mut inbox).await;
        assert_eq!(sup.phase(), LinkPhase::Connecting);

        spy.sink().connected();
        assert_eq!(pump(&mut sup, &mut inbox).await, Some(Transition::Connected));
        assert!(sup.state().is_connected);
        assert_eq!(sup.phase(), LinkPhase::Connected);

        spy.sink().raw("line");
        assert_eq!(
            pump(&mut sup, &mut inbox).await,
            Some(Transition::Data("line".into()))
        );
    }

    #[tokio::test]
    async fn error_rests_in_idle_without_retry() {
        let (mut sup, mut inbox) = Supervisor::new();
        let spy = start(&mut sup, &mut inbox).await;
        spy.sink().connected();
        pump(&mut sup, &mut inbox).await;

        spy
            .sink()
            .fail(TransportFault::new("connection refused").with_code("ECONNREFUSED"));
        assert_eq!(
            pump(&mut sup, &mut inbox).await,
            Some(Transition::Failed("ECONNREFUSED: connection refused".into()))
        );
        assert_eq!(sup.phase(), LinkPhase::Idle);
        assert!(!sup.state().is_connected);
        assert_eq!(
            sup.state().error.as_deref(),
            Some("ECONNREFUSED: connection refused")
        );
        // The terminal disconnected after the error is not a second transition.
        assert_eq!(pump(&mut sup, &mut inbox).await, None);

        tokio::time::sleep(GRACE * 5).await;
        assert!(inbox.due.try_recv().is_err(), "no reconnect may be scheduled");
        assert_eq!(spy.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_clears_error_and_supersedes_old_generation() {
        let (mut sup, mut inbox) = Supervisor::new();
        let spy = start(&mut sup, &mut inbox).await;
        let old_generation = sup.generation();
        spy.sink().error(TransportFault::new("boom"));
        pump(&mut sup, &mut inbox).await;
        assert!(sup.state().error.is_some());

        sup.schedule(GRACE, true).await;
        assert!(sup.state().error.is_none());
        assert_eq!(sup.phase(), LinkPhase::Connecting);

        let late = AdapterSignal {
            generation: old_generation,
            event: AdapterEvent::Connected,
        };
        assert_eq!(sup.on_signal(late), None);
        assert!(!sup.is_due(old_generation));
    }

    #[tokio::test]
    async fn stop_cancels_scheduled_connect() {
        let (mut sup, mut inbox) = Supervisor::new();
        sup.schedule(Duration::from_millis(30), false).await;
        assert_eq!(sup.stop().await, Some(Transition::Disconnected));
        assert_eq!(sup.phase(), LinkPhase::Idle);

        let waited = tokio::time::timeout(Duration::from_millis(100), inbox.due.recv()).await;
        assert!(waited.is_err(), "cancelled connect must never come due");
    }

    #[tokio::test]
    async fn stop_when_idle_is_silent() {
        let (mut sup, _inbox) = Supervisor::new();
        assert_eq!(sup.stop().await, None);
    }

    #[tokio::test]
    async fn rescheduling_tears_down_connected_adapter() {
        let (mut sup, mut inbox) = Supervisor::new();
        let spy = start(&mut sup, &mut inbox).await;
        spy.sink().connected();
        pump(&mut sup, &mut inbox).await;

        assert_eq!(
            sup.schedule(GRACE, true).await,
            Some(Transition::Disconnected)
        );
        assert_eq!(spy.disconnects.load(Ordering::SeqCst), 1);
        // The old adapter's terminal event belongs to a dead generation.
        assert_eq!(pump(&mut sup, &mut inbox).await, None);
    }

    #[tokio::test]
    async fn invalid_profile_fails_the_attempt() {
        let (mut sup, mut inbox) = Supervisor::new();
        sup.schedule(GRACE, false).await;
        let generation = inbox.due.recv().await.unwrap();
        let profile = ConnectionProfile {
            id: "broken".into(),
            name: "Broken".into(),
            transport: TransportConfig::Network {
                network_host: String::new(),
                network_port: 1457,
                protocol: Some(NetworkProtocol::Tcp),
            },
        };
        let Some(Transition::Failed(reason)) = sup.connect_due(generation, &profile).await else {
            panic!("expected a failure");
        };
        assert!(reason.contains("networkHost"));
        assert_eq!(sup.phase(), LinkPhase::Idle);
    }
}
