//! Configuration management for PeerSync.
//!
//! This module handles loading, saving, and validating engine configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/peersync/config.toml` |
//! | macOS | `~/Library/Application Support/PeerSync/config.toml` |
//! | Windows | `%APPDATA%\PeerSync\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use peersync_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for PeerSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Peer session settings
    pub session: SessionConfig,
    /// File transfer settings
    pub transfer: TransferConfig,
    /// Clipboard sync settings
    pub clipboard: ClipboardConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name announced to peers
    pub device_name: String,
    /// Platform tag sent in every message envelope
    pub platform: String,
    /// Directory for received files (None uses the system download directory)
    pub download_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "PeerSync Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            platform: std::env::consts::OS.to_string(),
            download_dir: None,
        }
    }
}

impl GeneralConfig {
    /// Resolve the directory received files are written to.
    #[must_use]
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

/// Peer session configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for a logical stream to become ready
    #[serde(with = "humantime_serde")]
    pub stream_ready_timeout: Duration,
    /// Timeout for every individual read or write on a peer stream
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Timeout for opening a stream through the transport
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Polling interval of the file-drop watcher
    #[serde(with = "humantime_serde")]
    pub file_drop_poll_interval: Duration,
    /// Capacity of the merged session event queue
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_ready_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            file_drop_poll_interval: Duration::from_millis(crate::DEFAULT_FILE_DROP_POLL_MS),
            event_buffer: 64,
        }
    }
}

/// File transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers per direction that may run at once for one peer
    pub max_concurrent_transfers: usize,
    /// Transfers that may be queued for one peer
    pub max_queued_transfers: usize,
    /// Copy buffer size in bytes
    pub chunk_size: usize,
    /// Interval between progress reports
    #[serde(with = "humantime_serde")]
    pub progress_tick: Duration,
    /// Accept incoming file drops without asking
    pub auto_accept: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: crate::DEFAULT_MAX_CONCURRENT_TRANSFERS,
            max_queued_transfers: crate::DEFAULT_MAX_QUEUED_TRANSFERS,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            progress_tick: Duration::from_millis(crate::DEFAULT_PROGRESS_TICK_MS),
            auto_accept: false,
        }
    }
}

/// Clipboard sync configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardConfig {
    /// Replicate clipboard changes to peers
    pub enabled: bool,
    /// Largest clipboard payload accepted from a peer
    pub max_payload_bytes: u64,
    /// How long a clipboard payload may take to arrive
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// This device understands the combined text+image+html format
    pub extended_format: bool,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_payload_bytes: 64 * 1024 * 1024,
            receive_timeout: Duration::from_secs(30),
            extended_format: true,
        }
    }
}

impl Config {
    /// Load the configuration file, or the defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the file exists but cannot be read or
    /// parsed, and `Error::InvalidConfig` if it fails validation.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to the defaults when the
    /// file is missing.
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`].
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::ConfigError(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigError(format!("bad TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Write the configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if a directory or the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, content)
        };
        write().map_err(|e| Error::ConfigError(format!("cannot write {}: {e}", path.display())))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("cannot serialize configuration: {e}")))
    }

    /// Check values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| Error::InvalidConfig {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.transfer.max_concurrent_transfers == 0 {
            return Err(invalid(
                "transfer.max_concurrent_transfers",
                "must be at least 1",
            ));
        }
        if self.transfer.max_queued_transfers < self.transfer.max_concurrent_transfers {
            return Err(invalid(
                "transfer.max_queued_transfers",
                "must not be smaller than max_concurrent_transfers",
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be at least 1 byte"));
        }
        if self.transfer.progress_tick.is_zero() {
            return Err(invalid("transfer.progress_tick", "must be non-zero"));
        }
        if self.session.file_drop_poll_interval.is_zero() {
            return Err(invalid("session.file_drop_poll_interval", "must be non-zero"));
        }
        if self.session.event_buffer == 0 {
            return Err(invalid("session.event_buffer", "must be at least 1"));
        }
        Ok(())
    }

    /// Platform configuration directory, if the OS reports one.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "peersync", "PeerSync")?;
        Some(dirs.config_dir().to_path_buf())
    }

    /// Location of `config.toml`. Falls back to the working directory.
    #[must_use]
    pub fn config_path() -> PathBuf {
        let mut path = Self::config_dir().unwrap_or_default();
        path.push("config.toml");
        path
    }
}

/// Durations as "250ms", "30s" or "5m".
mod humantime_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    const UNITS: [(&str, u64); 3] = [("ms", 1), ("s", 1000), ("m", 60_000)];

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let text = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        let (digits, per_unit) = UNITS
            .iter()
            .find_map(|&(suffix, ms)| text.strip_suffix(suffix).map(|d| (d, ms)))
            .ok_or_else(|| de::Error::custom(format!("'{text}' needs a ms, s or m suffix")))?;
        let count: u64 = digits.trim().parse().map_err(de::Error::custom)?;
        Ok(Duration::from_millis(count.saturating_mul(per_unit)))
    }
}
