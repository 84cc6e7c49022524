//! Recording Coordinator.
//!
//! Owns at most one open output file. Messages are written through the
//! serializer of the chosen [`RecordingFormat`]; `passthrough` writes the
//! raw line instead. A message that fails to serialize is skipped, a
//! failed write ends the recording.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pgnhub_middleware::wire;
use pgnhub_types::{HubError, PgnMessage, RecordingFile, RecordingFormat, RecordingStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::files;

/// Progress is reported every this many messages.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10;

/// Arguments of [`Recorder::start`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    #[serde(default)]
    pub file_name: Option<String>,
    pub format: RecordingFormat,
}

impl StartOptions {
    pub fn new(format: RecordingFormat) -> Self {
        Self {
            file_name: None,
            format,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

/// Something the orchestrator should broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Progress(RecordingStatus),
    /// The recording was stopped because of a write failure.
    Failed {
        error: String,
        status: RecordingStatus,
    },
}

struct ActiveRecording {
    writer: BufWriter<File>,
    path: PathBuf,
    file_name: String,
    format: RecordingFormat,
    start_time: DateTime<Utc>,
    message_count: u64,
    bytes: u64,
}

impl ActiveRecording {
    fn status(&self) -> RecordingStatus {
        RecordingStatus {
            is_recording: true,
            file_name: Some(self.file_name.clone()),
            file_path: Some(self.path.display().to_string()),
            format: Some(self.format),
            start_time: Some(self.start_time),
            message_count: self.message_count,
            file_size: self.bytes,
        }
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.bytes += text.len() as u64;
        Ok(())
    }
}

/// Opens a fresh recording file, failing if it already exists.
type Opener = fn(&Path) -> io::Result<File>;

fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

pub struct Recorder {
    dir: PathBuf,
    progress_interval: u64,
    active: Option<ActiveRecording>,
    opener: Opener,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            active: None,
            opener: create_exclusive,
        }
    }

    pub fn with_progress_interval(mut self, every: u64) -> Self {
        self.progress_interval = every.max(1);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn status(&self) -> RecordingStatus {
        self.active
            .as_ref()
            .map(ActiveRecording::status)
            .unwrap_or_default()
    }

    fn file_name_for(options: &StartOptions) -> String {
        let ext = options.format.extension();
        match options.file_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                if name.to_ascii_lowercase().ends_with(&format!(".{ext}")) {
                    name.to_string()
                } else {
                    format!("{name}.{ext}")
                }
            }
            _ => format!(
                "recording_{}.{ext}",
                Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f")
            ),
        }
    }

    pub fn start(&mut self, options: StartOptions) -> Result<RecordingStatus, HubError> {
        if self.active.is_some() {
            return Err(HubError::AlreadyRecording);
        }
        let file_name = Self::file_name_for(&options);
        let path = files::resolve(&self.dir, &file_name)?;
        if path.exists() {
            return Err(HubError::FileExists(file_name));
        }
        fs::create_dir_all(&self.dir)?;
        let file = (self.opener)(&path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => HubError::FileExists(file_name.clone()),
            _ => HubError::FileSystem(format!("cannot create {}: {e}", path.display())),
        })?;

        let mut active = ActiveRecording {
            writer: BufWriter::new(file),
            path,
            file_name,
            format: options.format,
            start_time: Utc::now(),
            message_count: 0,
            bytes: 0,
        };
        let header = active
            .write(wire::file_header(options.format))
            .and_then(|_| active.writer.flush());
        if let Err(e) = header {
            let ActiveRecording { writer, path, .. } = active;
            drop(writer);
            if let Err(rm) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %rm, "could not remove unusable recording");
            }
            return Err(HubError::FileSystem(format!(
                "cannot write {}: {e}",
                path.display()
            )));
        }
        info!(file = %active.file_name, format = %active.format, "recording started");
        let status = active.status();
        self.active = Some(active);
        Ok(status)
    }

    /// Finalise and close the file. The recorder is idle afterwards even
    /// when finalisation fails.
    pub fn stop(&mut self) -> Result<RecordingStatus, HubError> {
        let mut active = self.active.take().ok_or(HubError::NotRecording)?;
        let mut status = active.status();
        let finished = active
            .write(wire::file_trailer(active.format))
            .and_then(|_| active.writer.flush());
        status.is_recording = false;
        status.file_size = active.bytes;
        match finished {
            Ok(()) => {
                info!(
                    file = %status.file_name.as_deref().unwrap_or_default(),
                    messages = status.message_count,
                    bytes = status.file_size,
                    "recording stopped"
                );
                Ok(status)
            }
            Err(e) => {
                error!(error = %e, "failed to finalise recording");
                Err(HubError::FileSystem(format!("failed to finalise recording: {e}")))
            }
        }
    }

    /// Write one message. `decoded` is required for every format except
    /// `passthrough`. No-op when idle.
    pub fn record(&mut self, raw: &str, decoded: Option<&PgnMessage>) -> Option<RecorderEvent> {
        let active = self.active.as_mut()?;
        let format = active.format;
        let body = match format {
            RecordingFormat::Passthrough => raw.to_string(),
            _ => {
                let msg = decoded?;
                match wire::serialize(format, msg) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(pgn = msg.pgn, %format, error = %e, "skipping message");
                        return None;
                    }
                }
            }
        };
        let text = format!(
            "{}{body}{}",
            wire::record_prefix(format, active.message_count == 0),
            wire::record_suffix(format)
        );

        if let Err(e) = active.write(&text) {
            return self.active.take().map(|active| abort(active, e));
        }
        active.message_count += 1;

        if active.message_count % self.progress_interval == 0 {
            if let Err(e) = active.writer.flush() {
                return self.active.take().map(|active| abort(active, e));
            }
            return Some(RecorderEvent::Progress(active.status()));
        }
        None
    }

    pub fn files(&self) -> Result<Vec<RecordingFile>, HubError> {
        files::list(&self.dir)
    }

    /// Path of an existing recording, for download.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, HubError> {
        files::resolve_existing(&self.dir, name)
    }

    pub fn delete_file(&self, name: &str) -> Result<(), HubError> {
        let active = self.active.as_ref().map(|a| a.path.as_path());
        files::delete(&self.dir, name, active)
    }
}

/// End a recording after an I/O failure.
fn abort(mut active: ActiveRecording, e: io::Error) -> RecorderEvent {
    warn!(file = %active.file_name, error = %e, "recording write failed, stopping");
    let error = format!("write to {} failed: {e}", active.file_name);
    let mut status = active.status();
    status.is_recording = false;
    // The handle is dropped whatever happens here.
    let _ = active.writer.flush();
    RecorderEvent::Failed { error, status }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.active.is_some()
            && let Err(e) = self.stop()
        {
            warn!(error = %e, "recording not finalised on shutdown");
        }
    }
}
