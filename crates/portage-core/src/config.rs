//! Configuration system for Portage.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PORTAGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/portage/config.toml
//!   3. ~/.config/portage/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortageConfig {
    pub transfer: TransferConfig,
    pub throttle: ThrottleConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
}

/// Retry discipline and concurrency caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Seconds an unacknowledged chunk may wait before a resend.
    pub packet_timeout_secs: u64,
    /// Resends of one chunk before the transfer is dropped.
    pub retry_limit: u32,
    /// Seconds a registered send buffer waits to be requested.
    pub registration_timeout_secs: u64,
    /// Simultaneously active outgoing transfers per remote host.
    pub max_active_per_host: usize,
    /// Simultaneously active incoming transfers, process-wide.
    pub max_incoming: usize,
}

/// Acknowledgement bandwidth limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// When false, acks go out the moment a chunk is accepted.
    pub enabled: bool,
    /// Ack channel budget in bits per second.
    pub ack_rate_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Content-addressed store root.
    pub store_path: PathBuf,
    /// Directory where validated cache-named downloads land.
    pub inbox_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP bind address for the daemon.
    pub bind_addr: String,
    /// Heartbeat period driving the retry sweep.
    pub tick_interval_ms: u64,
    /// Seconds of silence after which a previously-heard peer counts as gone.
    pub peer_ttl_secs: u64,
}

impl TransferConfig {
    pub fn packet_timeout(&self) -> Duration {
        Duration::from_secs(self.packet_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}

impl PortageConfig {
    /// Effective ack throttle rate in bits per second.
    ///
    /// The configured rate is clamped so the throttle can never fall behind
    /// the slowest possible ack schedule: `max_incoming` transfers each
    /// forced to one ack per packet timeout.
    pub fn effective_ack_rate_bps(&self) -> f64 {
        let min_bps = (1000.0 * 8.0 * self.transfer.max_incoming as f64)
            / self.transfer.packet_timeout_secs as f64;
        (min_bps * 1.1).max(self.throttle.ack_rate_bps)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PortageConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            throttle: ThrottleConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            packet_timeout_secs: 3,
            retry_limit: 10,
            registration_timeout_secs: 60,
            max_active_per_host: 10,
            max_incoming: 1000,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ack_rate_bps: 100_000.0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: data_dir().join("store"),
            inbox_path: data_dir().join("inbox"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7667".to_string(),
            tick_interval_ms: 500,
            peer_ttl_secs: 30,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("portage")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("portage")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PortageConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PortageConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PORTAGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PortageConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PORTAGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTAGE_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("PORTAGE_NETWORK__TICK_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.network.tick_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_TRANSFER__MAX_INCOMING") {
            if let Ok(n) = v.parse() {
                self.transfer.max_incoming = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_TRANSFER__MAX_ACTIVE_PER_HOST") {
            if let Ok(n) = v.parse() {
                self.transfer.max_active_per_host = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_THROTTLE__ENABLED") {
            self.throttle.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PORTAGE_THROTTLE__ACK_RATE_BPS") {
            if let Ok(bps) = v.parse() {
                self.throttle.ack_rate_bps = bps;
            }
        }
        if let Ok(v) = std::env::var("PORTAGE_STORAGE__STORE_PATH") {
            self.storage.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PORTAGE_STORAGE__INBOX_PATH") {
            self.storage.inbox_path = PathBuf::from(v);
        }
    }
}
