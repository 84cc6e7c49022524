//! `pgnhub-types` – shared data model for the PGN hub.
//!
//! Every other crate in the workspace speaks in terms of these types:
//!
//! - [`profile`] – connection profiles, one closed variant per transport.
//! - [`state`] – connection, auth and recording status snapshots.
//! - [`message`] – the structured PGN message exchanged with the codec.
//! - [`broadcast`] – the envelope pushed to real-time subscribers.
//! - [`fault`] – normalised transport faults.

pub mod broadcast;
pub mod fault;
pub mod message;
pub mod profile;
pub mod state;

pub use broadcast::BroadcastMessage;
pub use fault::TransportFault;
pub use message::PgnMessage;
pub use profile::{ConnectionProfile, NetworkProtocol, SerialDeviceType, TransportConfig};
pub use state::{
    AuthStatus, ConnectionState, LinkPhase, RecordingFile, RecordingFormat, RecordingStatus,
};

use thiserror::Error;

/// Coarse classification of a [`HubError`], used by outer layers to pick a
/// response code and by the orchestrator to decide what is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input; rejected synchronously.
    Validation,
    /// The caller asked for something the current state forbids.
    Precondition,
    /// A referenced profile or file does not exist.
    NotFound,
    /// I/O failure on a transport.
    Transport,
    /// The codec rejected a single line or message.
    Parse,
    /// Recording file or recordings directory failure.
    FileSystem,
    /// Anything else; surfaces as a 5xx.
    Internal,
}

/// Error type shared by every layer of the hub.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot delete the active connection profile '{0}'")]
    ActiveProfile(String),

    #[error("No active connection")]
    NoActiveConnection,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("No recording is in progress")]
    NotRecording,

    #[error("Recording file already exists: {0}")]
    FileExists(String),

    #[error("Path escapes the recordings directory: {0}")]
    PathTraversal(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Failed to persist configuration: {0}")]
    Persistence(String),

    #[error("Session channel error: {0}")]
    Channel(String),
}

impl HubError {
    /// Shorthand for a missing required field.
    pub fn missing(field: &str) -> Self {
        HubError::Validation {
            field: field.to_string(),
            reason: "is required".to_string(),
        }
    }

    /// Shorthand for a present-but-invalid field.
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        HubError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Validation { .. } | HubError::Unsupported(_) => ErrorKind::Validation,
            HubError::ActiveProfile(_)
            | HubError::NoActiveConnection
            | HubError::AlreadyRecording
            | HubError::NotRecording
            | HubError::FileExists(_)
            | HubError::PathTraversal(_) => ErrorKind::Precondition,
            HubError::NotFound(_) => ErrorKind::NotFound,
            HubError::Transport(_) => ErrorKind::Transport,
            HubError::Parse(_) => ErrorKind::Parse,
            HubError::FileSystem(_) => ErrorKind::FileSystem,
            HubError::Persistence(_) | HubError::Channel(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::FileSystem(e.to_string())
    }
}
