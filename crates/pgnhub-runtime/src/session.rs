//! [`Session`] – the orchestrator task.
//!
//! One tokio task owns the profile store, the recorder, the connection
//! state machine and the live codec. Everything else talks to it through a
//! cloneable [`SessionHandle`]: each call is a command on a bounded channel
//! with a oneshot reply, so there is exactly one writer for every piece of
//! session state and no locks around it.
//!
//! The task multiplexes three inputs:
//!
//! 1. commands from handles (REST handlers, the WebSocket layer, the CLI);
//! 2. adapter signals, tagged with their connect generation;
//! 3. "connect due" notices from the grace-period timer.
//!
//! Data lines are published on the [`BroadcastHub`] as raw output, then as
//! parsed output when the codec produced a message, then handed to the
//! recorder. Signals from one adapter are handled in arrival order.
//!
//! # Example
//!
//! ```rust,no_run
//! use pgnhub_middleware::BroadcastHub;
//! use pgnhub_recorder::Recorder;
//! use pgnhub_runtime::{ProfileStore, Session};
//!
//! # async fn run() -> Result<(), pgnhub_types::HubError> {
//! let store = ProfileStore::open("/var/lib/pgnhub/config.toml")?;
//! let recorder = Recorder::new("/var/lib/pgnhub/recordings");
//! let session = Session::new(store, recorder, BroadcastHub::default()).spawn();
//! session.activate("boat").await?;
//! # Ok(())
//! # }
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgnhub_middleware::{BroadcastHub, FrameCodec, PgnCodec, Subscription};
use pgnhub_recorder::{Recorder, RecorderEvent, StartOptions};
use pgnhub_types::broadcast::events;
use pgnhub_types::{
    AuthStatus, BroadcastMessage, ConnectionProfile, ConnectionState, HubError, LinkPhase,
    RecordingFile, RecordingStatus,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::profile_store::{HubConfig, ProfileStore, ServerConfig};
use crate::submit::{self, SubmitReport, SubmitRequest};
use crate::supervisor::{Supervisor, SupervisorInbox, Transition};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Wait before the first connect after a profile is activated.
    pub activate_grace: Duration,
    /// Wait before reconnecting on a manual restart.
    pub restart_grace: Duration,
    /// Depth of the command channel.
    pub command_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            activate_grace: Duration::from_secs(2),
            restart_grace: Duration::from_secs(1),
            command_buffer: 64,
        }
    }
}

/// Builds the codec for one input stream.
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn PgnCodec> + Send + Sync>;

/// Everything a client needs to render the current connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub phase: LinkPhase,
    pub active_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStatus>,
    pub recording: RecordingStatus,
}

impl StatusSnapshot {
    /// The synthesized event a fresh `status` subscriber receives.
    pub fn to_broadcast(&self) -> BroadcastMessage {
        let event = if self.state.is_connected {
            events::NMEA_CONNECTED
        } else {
            events::NMEA_DISCONNECTED
        };
        BroadcastMessage::new(event)
            .with_data(to_json(self))
            .with_auth(self.auth.clone())
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session (builder)
// ─────────────────────────────────────────────────────────────────────────────

pub struct Session {
    store: ProfileStore,
    recorder: Recorder,
    hub: BroadcastHub,
    settings: SessionSettings,
    codec: CodecFactory,
}

impl Session {
    pub fn new(store: ProfileStore, recorder: Recorder, hub: BroadcastHub) -> Self {
        Self {
            store,
            recorder,
            hub,
            settings: SessionSettings::default(),
            codec: Arc::new(|| Box::new(FrameCodec::new()) as Box<dyn PgnCodec>),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_codec(
        mut self,
        factory: impl Fn() -> Box<dyn PgnCodec> + Send + Sync + 'static,
    ) -> Self {
        self.codec = Arc::new(factory);
        self
    }

    /// Start the session task. Must be called inside a Tokio runtime.
    ///
    /// If the store names an active profile, its first connect is scheduled
    /// after the activation grace period.
    pub fn spawn(self) -> SessionHandle {
        let (tx, rx) = mpsc::channel(self.settings.command_buffer.max(1));
        let (supervisor, inbox) = Supervisor::new();
        let hub = self.hub.clone();
        let live_codec = (self.codec)();
        let task = SessionTask {
            store: self.store,
            recorder: self.recorder,
            hub: self.hub,
            settings: self.settings,
            codec: self.codec,
            live_codec,
            supervisor,
        };
        tokio::spawn(task.run(rx, inbox));
        SessionHandle { commands: tx, hub }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands and handle
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, HubError>>;

enum Command {
    Status(oneshot::Sender<StatusSnapshot>),
    Config(oneshot::Sender<HubConfig>),
    SetServer(ServerConfig, Reply<HubConfig>),
    ListProfiles(oneshot::Sender<Vec<ConnectionProfile>>),
    GetProfile(String, Reply<ConnectionProfile>),
    SaveProfile(ConnectionProfile, Reply<()>),
    DeleteProfile(String, Reply<()>),
    Activate(String, Reply<()>),
    Deactivate(Reply<()>),
    Restart(Reply<()>),
    RecordingStatus(oneshot::Sender<RecordingStatus>),
    StartRecording(StartOptions, Reply<RecordingStatus>),
    StopRecording(Reply<RecordingStatus>),
    ListRecordings(Reply<Vec<RecordingFile>>),
    RecordingPath(String, Reply<PathBuf>),
    DeleteRecording(String, Reply<()>),
    Submit(SubmitRequest, Reply<Vec<SubmitReport>>),
    Shutdown(oneshot::Sender<()>),
}

fn stopped() -> HubError {
    HubError::Channel("session task is not running".into())
}

/// Cloneable front door to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    hub: BroadcastHub,
}

impl SessionHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub async fn status(&self) -> Result<StatusSnapshot, HubError> {
        self.call(Command::Status).await
    }

    pub async fn config(&self) -> Result<HubConfig, HubError> {
        self.call(Command::Config).await
    }

    /// Replace the `server` section. Takes effect on the next start.
    pub async fn set_server(&self, server: ServerConfig) -> Result<HubConfig, HubError> {
        self.call(|reply| Command::SetServer(server, reply)).await?
    }

    pub async fn list_profiles(&self) -> Result<Vec<ConnectionProfile>, HubError> {
        self.call(Command::ListProfiles).await
    }

    pub async fn get_profile(&self, id: &str) -> Result<ConnectionProfile, HubError> {
        let id = id.to_string();
        self.call(|reply| Command::GetProfile(id, reply)).await?
    }

    pub async fn save_profile(&self, profile: ConnectionProfile) -> Result<(), HubError> {
        self.call(|reply| Command::SaveProfile(profile, reply)).await?
    }

    pub async fn delete_profile(&self, id: &str) -> Result<(), HubError> {
        let id = id.to_string();
        self.call(|reply| Command::DeleteProfile(id, reply)).await?
    }

    /// Make `id` the active profile and (re)connect after the grace period.
    pub async fn activate(&self, id: &str) -> Result<(), HubError> {
        let id = id.to_string();
        self.call(|reply| Command::Activate(id, reply)).await?
    }

    pub async fn deactivate(&self) -> Result<(), HubError> {
        self.call(Command::Deactivate).await?
    }

    pub async fn restart(&self) -> Result<(), HubError> {
        self.call(Command::Restart).await?
    }

    pub async fn recording_status(&self) -> Result<RecordingStatus, HubError> {
        self.call(Command::RecordingStatus).await
    }

    pub async fn start_recording(&self, options: StartOptions) -> Result<RecordingStatus, HubError> {
        self.call(|reply| Command::StartRecording(options, reply)).await?
    }

    pub async fn stop_recording(&self) -> Result<RecordingStatus, HubError> {
        self.call(Command::StopRecording).await?
    }

    pub async fn recordings(&self) -> Result<Vec<RecordingFile>, HubError> {
        self.call(Command::ListRecordings).await?
    }

    /// Resolved path of an existing recording.
    pub async fn recording_path(&self, name: &str) -> Result<PathBuf, HubError> {
        let name = name.to_string();
        self.call(|reply| Command::RecordingPath(name, reply)).await?
    }

    pub async fn delete_recording(&self, name: &str) -> Result<(), HubError> {
        let name = name.to_string();
        self.call(|reply| Command::DeleteRecording(name, reply)).await?
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<Vec<SubmitReport>, HubError> {
        self.call(|reply| Command::Submit(request, reply)).await?
    }

    /// Stop recording, disconnect and end the task.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.call(Command::Shutdown).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

struct SessionTask {
    store: ProfileStore,
    recorder: Recorder,
    hub: BroadcastHub,
    settings: SessionSettings,
    codec: CodecFactory,
    live_codec: Box<dyn PgnCodec>,
    supervisor: Supervisor,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbox: SupervisorInbox) {
        if let Some(id) = self.store.active_id().map(str::to_string) {
            info!(profile = %id, "resuming persisted active profile");
            self.begin(self.settings.activate_grace).await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle(command).await.is_break() {
                            return;
                        }
                    }
                    None => break,
                },
                Some(signal) = inbox.signals.recv() => {
                    if let Some(transition) = self.supervisor.on_signal(signal) {
                        self.apply(transition);
                    }
                }
                Some(generation) = inbox.due.recv() => self.connect_due(generation).await,
            }
        }
        debug!("all session handles dropped");
        self.shutdown().await;
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Config(reply) => {
                let _ = reply.send(self.store.config().clone());
            }
            Command::SetServer(server, reply) => {
                let result = self
                    .store
                    .set_server(server)
                    .map(|()| self.store.config().clone());
                let _ = reply.send(result);
            }
            Command::ListProfiles(reply) => {
                let _ = reply.send(self.store.list());
            }
            Command::GetProfile(id, reply) => {
                let _ = reply.send(self.store.get(&id));
            }
            Command::SaveProfile(profile, reply) => {
                let _ = reply.send(self.store.save(profile));
            }
            Command::DeleteProfile(id, reply) => {
                let _ = reply.send(self.store.delete(&id).map(|_| ()));
            }
            Command::Activate(id, reply) => {
                let result = self.activate(&id).await;
                let _ = reply.send(result);
            }
            Command::Deactivate(reply) => {
                let result = self.deactivate().await;
                let _ = reply.send(result);
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Command::RecordingStatus(reply) => {
                let _ = reply.send(self.recorder.status());
            }
            Command::StartRecording(options, reply) => {
                let result = self.recorder.start(options);
                if let Ok(status) = &result {
                    self.hub.publish(
                        BroadcastMessage::new(events::RECORDING_STARTED).with_data(to_json(status)),
                    );
                }
                let _ = reply.send(result);
            }
            Command::StopRecording(reply) => {
                let result = self.stop_recording();
                let _ = reply.send(result);
            }
            Command::ListRecordings(reply) => {
                let _ = reply.send(self.recorder.files());
            }
            Command::RecordingPath(name, reply) => {
                let _ = reply.send(self.recorder.file_path(&name));
            }
            Command::DeleteRecording(name, reply) => {
                let _ = reply.send(self.recorder.delete_file(&name));
            }
            Command::Submit(request, reply) => {
                let result = self.submit(request).await;
                let _ = reply.send(result);
            }
            Command::Shutdown(done) => {
                self.shutdown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.supervisor.state().clone(),
            phase: self.supervisor.phase(),
            active_profile: self.store.active_id().map(str::to_string),
            auth: self.supervisor.auth(),
            recording: self.recorder.status(),
        }
    }

    // ── Connection control ────────────────────────────────────────────────

    async fn begin(&mut self, delay: Duration) {
        if let Some(transition) = self.supervisor.schedule(delay, true).await {
            self.apply(transition);
        }
    }

    async fn activate(&mut self, id: &str) -> Result<(), HubError> {
        self.store.set_active(Some(id))?;
        info!(profile = %id, "profile activated");
        self.begin(self.settings.activate_grace).await;
        Ok(())
    }

    async fn deactivate(&mut self) -> Result<(), HubError> {
        self.store.set_active(None)?;
        info!("active profile cleared");
        if let Some(transition) = self.supervisor.stop().await {
            self.apply(transition);
        }
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), HubError> {
        let Some(id) = self.store.active_id().map(str::to_string) else {
            return Err(HubError::NoActiveConnection);
        };
        info!(profile = %id, "manual restart");
        self.begin(self.settings.restart_grace).await;
        Ok(())
    }

    async fn connect_due(&mut self, generation: u64) {
        if !self.supervisor.is_due(generation) {
            return;
        }
        let Some(profile) = self.store.active_profile().cloned() else {
            warn!("connect came due without an active profile");
            return;
        };
        self.live_codec = (self.codec)();
        info!(profile = %profile.id, kind = profile.transport.type_name(), "connecting");
        if let Some(transition) = self.supervisor.connect_due(generation, &profile).await {
            self.apply(transition);
        }
    }

    async fn shutdown(&mut self) {
        if self.recorder.is_recording()
            && let Err(e) = self.stop_recording()
        {
            warn!(error = %e, "recording could not be finalised on shutdown");
        }
        if let Some(transition) = self.supervisor.stop().await {
            self.apply(transition);
        }
        info!("session stopped");
    }

    // ── Publishing ────────────────────────────────────────────────────────

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Connected => self.publish_state(events::NMEA_CONNECTED),
            Transition::Disconnected => self.publish_state(events::NMEA_DISCONNECTED),
            Transition::Failed(reason) => {
                self.hub.publish(
                    BroadcastMessage::new(events::ERROR)
                        .with_error(reason)
                        .with_data(to_json(self.supervisor.state()))
                        .with_auth(self.supervisor.auth()),
                );
            }
            Transition::Data(line) => self.on_line(line),
            Transition::Delta(delta) => {
                self.hub
                    .publish(BroadcastMessage::new(events::SIGNALK_DELTA).with_data(delta));
            }
            Transition::Auth(status) => {
                self.hub
                    .publish(BroadcastMessage::new(events::SIGNALK_AUTH).with_auth(Some(status)));
            }
        }
    }

    fn publish_state(&self, event: &str) {
        self.hub.publish(
            BroadcastMessage::new(event)
                .with_data(to_json(self.supervisor.state()))
                .with_auth(self.supervisor.auth()),
        );
    }

    fn on_line(&mut self, line: String) {
        let parsed = match self.live_codec.parse(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, %line, "line not decoded");
                None
            }
        };
        self.hub
            .publish(BroadcastMessage::new(events::RAW_OUTPUT).with_data(Value::String(line.clone())));
        if let Some(msg) = &parsed {
            self.hub
                .publish(BroadcastMessage::new(events::PARSED).with_data(to_json(msg)));
        }
        if let Some(event) = self.recorder.record(&line, parsed.as_ref()) {
            self.publish_recorder(event);
        }
    }

    fn publish_recorder(&self, event: RecorderEvent) {
        let message = match event {
            RecorderEvent::Progress(status) => {
                BroadcastMessage::new(events::RECORDING_PROGRESS).with_data(to_json(&status))
            }
            RecorderEvent::Failed { error, status } => BroadcastMessage::new(events::RECORDING_ERROR)
                .with_error(error)
                .with_data(to_json(&status)),
        };
        self.hub.publish(message);
    }

    fn stop_recording(&mut self) -> Result<RecordingStatus, HubError> {
        let status = self.recorder.stop()?;
        self.hub
            .publish(BroadcastMessage::new(events::RECORDING_STOPPED).with_data(to_json(&status)));
        Ok(status)
    }

    // ── Submission ────────────────────────────────────────────────────────

    async fn submit(&mut self, request: SubmitRequest) -> Result<Vec<SubmitReport>, HubError> {
        let codec = (self.codec)();
        let mut reports = submit::decode_batch(&request.input, codec.as_ref())?;
        if request.transmit {
            let adapter = self
                .supervisor
                .adapter()
                .filter(|_| self.supervisor.phase() == LinkPhase::Connected);
            for report in &mut reports {
                let Some(msg) = &report.message else {
                    continue;
                };
                let outcome = match adapter {
                    Some(adapter) => adapter.send(msg).await,
                    None => Err(HubError::NoActiveConnection),
                };
                report.record_transmit(outcome);
            }
        }
        Ok(reports)
    }
}
