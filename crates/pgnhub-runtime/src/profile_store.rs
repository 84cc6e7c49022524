//! Profile store – the persisted hub document.
//!
//! One TOML document holds the server settings and every connection
//! profile:
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [connections]
//! activeConnection = "boat"
//!
//! [connections.profiles.boat]
//! id = "boat"
//! name = "Boat"
//! type = "network"
//! networkHost = "192.168.1.10"
//! networkPort = 1457
//! protocol = "tcp"
//! ```
//!
//! Every mutation is applied to a copy, the copy is written in full, and
//! only then does it replace the in-memory document. A failed write leaves
//! both the file and the store as they were.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pgnhub_types::{ConnectionProfile, HubError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 3000;

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connection: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ConnectionProfile>,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Disk I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Read the document at `path`. `Ok(None)` when the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<HubConfig>, HubError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        HubError::Persistence(format!("failed to read {}: {e}", path.display()))
    })?;
    let config: HubConfig = toml::from_str(&raw).map_err(|e| {
        HubError::Persistence(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(config))
}

/// Write `config` to `path`, owner-only on Unix: the file is 0600, and a
/// directory created here is 0700. An existing directory keeps its mode.
pub fn save_to(config: &HubConfig, path: &Path) -> Result<(), HubError> {
    let fail = |what: &str, e: &dyn std::fmt::Display| {
        HubError::Persistence(format!("failed to {what} {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| fail("create directory for", &e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| fail("restrict directory of", &e))?;
        }
    }
    let raw = toml::to_string_pretty(config).map_err(|e| fail("serialize", &e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| fail("write", &e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| fail("write", &e))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// ProfileStore
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the hub document. Only the session task holds one, so writes
/// are serialised by construction.
#[derive(Debug)]
pub struct ProfileStore {
    path: Option<PathBuf>,
    config: HubConfig,
}

impl ProfileStore {
    /// Load the document at `path`, starting empty when it does not exist.
    /// An active pointer naming a missing profile is dropped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HubError> {
        let path = path.into();
        let mut config = load_from(&path)?.unwrap_or_default();
        if let Some(active) = config.connections.active_connection.clone()
            && !config.connections.profiles.contains_key(&active)
        {
            warn!(profile = %active, "active connection names an unknown profile; ignoring it");
            config.connections.active_connection = None;
        }
        info!(
            path = %path.display(),
            profiles = config.connections.profiles.len(),
            "profile store loaded"
        );
        Ok(Self {
            path: Some(path),
            config,
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory(config: HubConfig) -> Self {
        Self { path: None, config }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn list(&self) -> Vec<ConnectionProfile> {
        self.config.connections.profiles.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<ConnectionProfile, HubError> {
        self.config
            .connections
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("connection profile '{id}'")))
    }

    pub fn active_id(&self) -> Option<&str> {
        self.config.connections.active_connection.as_deref()
    }

    pub fn active_profile(&self) -> Option<&ConnectionProfile> {
        self.active_id()
            .and_then(|id| self.config.connections.profiles.get(id))
    }

    /// Validate and insert or replace `profile`. Does not reconnect.
    pub fn save(&mut self, profile: ConnectionProfile) -> Result<(), HubError> {
        profile.validate()?;
        let id = profile.id.clone();
        self.commit(|config| {
            config.connections.profiles.insert(profile.id.clone(), profile);
            Ok(())
        })?;
        info!(profile = %id, "connection profile saved");
        Ok(())
    }

    /// Remove a profile. The active one is refused.
    pub fn delete(&mut self, id: &str) -> Result<ConnectionProfile, HubError> {
        if self.active_id() == Some(id) {
            return Err(HubError::ActiveProfile(id.to_string()));
        }
        let removed = self.get(id)?;
        self.commit(|config| {
            config.connections.profiles.remove(id);
            Ok(())
        })?;
        info!(profile = %id, "connection profile deleted");
        Ok(removed)
    }

    /// Point the active pointer at `id`, or clear it with `None`.
    pub fn set_active(&mut self, id: Option<&str>) -> Result<(), HubError> {
        if let Some(id) = id {
            self.get(id)?;
        }
        self.commit(|config| {
            config.connections.active_connection = id.map(str::to_string);
            Ok(())
        })?;
        debug!(profile = ?id, "active connection updated");
        Ok(())
    }

    pub fn set_server(&mut self, server: ServerConfig) -> Result<(), HubError> {
        if server.port == 0 {
            return Err(HubError::invalid("port", "must be 1-65535"));
        }
        self.commit(|config| {
            config.server = server;
            Ok(())
        })
    }

    fn commit(
        &mut self,
        change: impl FnOnce(&mut HubConfig) -> Result<(), HubError>,
    ) -> Result<(), HubError> {
        let mut next = self.config.clone();
        change(&mut next)?;
        if let Some(path) = &self.path
            && let Err(e) = save_to(&next, path)
        {
            error!(error = %e, "profile store could not be persisted");
            return Err(e);
        }
        self.config = next;
        Ok(())
    }
}
