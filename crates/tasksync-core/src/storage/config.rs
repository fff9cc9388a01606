//! TOML-based node configuration.
//!
//! Only the `[sync]` table is defined:
//!
//! ```toml
//! [sync]
//! enabled = true
//! listen_port = 27850
//! reconnect_interval_secs = 10
//! dedup_window_secs = 900
//! send_timeout_ms = 5000
//!
//! [[sync.peers]]
//! host = "192.168.1.20"
//! port = 27850
//! ```
//!
//! Configuration is stored at `<data_dir>/config.toml`. Environment variables
//! override the file; see [`SyncConfig::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.toml";

/// Address of a statically configured peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerAddr>,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Per-peer write deadline; a peer that misses it is dropped.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Restrict manifest exchange to this owner.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Outbox file name inside the data directory.
    #[serde(default = "default_outbox_file")]
    pub outbox_file: String,
}

/// Node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_listen_port() -> u16 {
    27850
}
fn default_reconnect_interval_secs() -> u64 {
    10
}
fn default_dedup_window_secs() -> u64 {
    15 * 60
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_outbox_file() -> String {
    "pending_outbox.json".into()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: default_listen_port(),
            peers: Vec::new(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            user_id: None,
            outbox_file: default_outbox_file(),
        }
    }
}

impl SyncConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    /// Apply overrides from the process environment.
    ///
    /// - `TASKSYNC_SYNC_DISABLED` = `1`/`true` disables sync
    /// - `TASKSYNC_SYNC_PORT` replaces the listen port
    /// - `TASKSYNC_PEER_HOST` + `TASKSYNC_PEER_PORT` add one peer
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::apply_env_overrides`] with an injectable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TASKSYNC_SYNC_DISABLED") {
            if matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                self.enabled = false;
            }
        }

        if let Some(value) = lookup("TASKSYNC_SYNC_PORT") {
            self.listen_port = parse_port("TASKSYNC_SYNC_PORT", &value)?;
        }

        match (lookup("TASKSYNC_PEER_HOST"), lookup("TASKSYNC_PEER_PORT")) {
            (Some(host), Some(port)) if !host.trim().is_empty() => {
                let peer = PeerAddr::new(host.trim(), parse_port("TASKSYNC_PEER_PORT", &port)?);
                if !self.peers.contains(&peer) {
                    self.peers.push(peer);
                }
            }
            (Some(_), None) => {
                return Err(ConfigError::InvalidValue {
                    key: "TASKSYNC_PEER_PORT".into(),
                    message: "required when TASKSYNC_PEER_HOST is set".into(),
                });
            }
            _ => {}
        }

        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        })
}

impl Config {
    fn path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from(CONFIG_FILE),
            message: e.to_string(),
        })?;
        Ok(dir.join(CONFIG_FILE))
    }

    /// Load from `path`, or return the default when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Load `<data_dir>/config.toml` and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::load_from(&Self::path()?)?;
        cfg.sync.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Persist to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Persist to `<data_dir>/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }
}
