//! Bootstrap settings – where the hub keeps its files and which port it
//! binds.
//!
//! Everything lives under `~/.pgnhub/` unless overridden:
//!
//! | Variable | Setting |
//! |---|---|
//! | `PGNHUB_CONFIG` | configuration document (`~/.pgnhub/config.toml`) |
//! | `PGNHUB_RECORDINGS_DIR` | recordings directory (`~/.pgnhub/recordings`) |
//! | `PGNHUB_PORT` | listening port, wins over `server.port` |

use std::path::PathBuf;

pub const CONFIG_ENV: &str = "PGNHUB_CONFIG";
pub const RECORDINGS_DIR_ENV: &str = "PGNHUB_RECORDINGS_DIR";
pub const PORT_ENV: &str = "PGNHUB_PORT";

#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    pub config_path: PathBuf,
    pub recordings_dir: PathBuf,
    /// Set only by a valid `PGNHUB_PORT`.
    pub port_override: Option<u16>,
}

impl Bootstrap {
    /// Defaults under `<home>/.pgnhub`.
    pub fn for_home(home: &str) -> Self {
        let root = data_dir_for_home(home);
        Self {
            config_path: root.join("config.toml"),
            recordings_dir: root.join("recordings"),
            port_override: None,
        }
    }

    /// Defaults for the current user with environment overrides applied.
    pub fn from_env() -> Self {
        let mut boot = Self::for_home(&home_dir());
        boot.apply_env_overrides();
        boot
    }

    /// Apply `PGNHUB_*` overrides. Empty values and invalid ports are
    /// ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(CONFIG_ENV)
            && !v.trim().is_empty()
        {
            self.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(RECORDINGS_DIR_ENV)
            && !v.trim().is_empty()
        {
            self.recordings_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(PORT_ENV)
            && let Ok(port) = v.trim().parse::<u16>()
            && port != 0
        {
            self.port_override = Some(port);
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

pub(crate) fn data_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pgnhub")
}
