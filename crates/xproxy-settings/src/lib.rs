//! Layered TOML configuration and JSON policy files for xproxy.
//!
//! Settings are loaded from:
//! - Global config: `~/.config/xproxy/xproxy.toml`
//! - Project config: `<workspace>/.xproxy/xproxy.toml`
//!
//! Project values take precedence when set. The blocklist and redirect table
//! live in separate JSON files named by the `[policy]` section and are read
//! through [`PolicyFiles`].
//!
//! # Example
//!
//! ```no_run
//! use xproxy_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."), None).unwrap();
//! println!("listening on port {}", config.proxy.port());
//! ```

mod loader;
mod policy_files;

pub use loader::ConfigLoader;
pub use policy_files::{PolicyFiles, DEFAULT_BLOCKLIST, DEFAULT_REDIRECTS};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default blocklist file, relative to the working directory.
pub const DEFAULT_BLOCKLIST_PATH: &str = "json/blacklist.json";

/// Default redirect table file, relative to the working directory.
pub const DEFAULT_REDIRECTS_PATH: &str = "json/redirects.json";

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A policy file is not the expected JSON shape.
    #[error("Invalid policy file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// I/O error reading or writing a config or policy file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[proxy]` section.
///
/// Every field is optional so that layers only override what they set; the
/// accessor methods fill in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    /// Address to listen on (default `0.0.0.0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,

    /// Port to listen on (default 8080).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Listen backlog (default 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<u32>,

    /// Socket send/receive buffer size in bytes (default 512 KiB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_buffer_bytes: Option<usize>,

    /// Relay chunk size in bytes (default 256 KiB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_bytes: Option<usize>,

    /// Per-read and per-write timeout in seconds (default 30).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout_secs: Option<u64>,

    /// Origin resolve+connect timeout in seconds (default 30).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Maximum concurrent connections (default unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl ProxySettings {
    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn backlog(&self) -> u32 {
        self.backlog.unwrap_or(500)
    }

    pub fn socket_buffer_bytes(&self) -> usize {
        self.socket_buffer_bytes.unwrap_or(512 * 1024)
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes.unwrap_or(256 * 1024)
    }

    pub fn io_timeout_secs(&self) -> u64 {
        self.io_timeout_secs.unwrap_or(30)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(30)
    }
}

/// TOML `[policy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    /// JSON array of blocked domains (default `json/blacklist.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocklist_path: Option<PathBuf>,

    /// JSON object of hostname redirects (default `json/redirects.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirects_path: Option<PathBuf>,
}

impl PolicySettings {
    pub fn blocklist_path(&self) -> PathBuf {
        self.blocklist_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOCKLIST_PATH))
    }

    pub fn redirects_path(&self) -> PathBuf {
        self.redirects_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REDIRECTS_PATH))
    }
}

/// Top-level xproxy configuration, corresponding to `xproxy.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XProxyConfig {
    /// Listener and connection settings.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Policy file locations.
    #[serde(default)]
    pub policy: PolicySettings,
}

impl XProxyConfig {
    /// Parse an `XProxyConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load an `XProxyConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Copy with every unset field filled in with its default.
    ///
    /// `max_connections` stays unset when not configured (unbounded).
    pub fn resolved(&self) -> Self {
        Self {
            proxy: ProxySettings {
                bind_address: Some(self.proxy.bind_address()),
                port: Some(self.proxy.port()),
                backlog: Some(self.proxy.backlog()),
                socket_buffer_bytes: Some(self.proxy.socket_buffer_bytes()),
                chunk_bytes: Some(self.proxy.chunk_bytes()),
                io_timeout_secs: Some(self.proxy.io_timeout_secs()),
                connect_timeout_secs: Some(self.proxy.connect_timeout_secs()),
                max_connections: self.proxy.max_connections,
            },
            policy: PolicySettings {
                blocklist_path: Some(self.policy.blocklist_path()),
                redirects_path: Some(self.policy.redirects_path()),
            },
        }
    }

    /// Config with every field set to its default, for starter files.
    pub fn starter() -> Self {
        Self::default().resolved()
    }

    /// Merge `other` (higher-priority layer) on top of `self`.
    ///
    /// Each field of `other` wins when explicitly set (`Some`).
    #[must_use]
    pub fn merge(mut self, other: XProxyConfig) -> XProxyConfig {
        let p = other.proxy;
        if p.bind_address.is_some() {
            self.proxy.bind_address = p.bind_address;
        }
        if p.port.is_some() {
            self.proxy.port = p.port;
        }
        if p.backlog.is_some() {
            self.proxy.backlog = p.backlog;
        }
        if p.socket_buffer_bytes.is_some() {
            self.proxy.socket_buffer_bytes = p.socket_buffer_bytes;
        }
        if p.chunk_bytes.is_some() {
            self.proxy.chunk_bytes = p.chunk_bytes;
        }
        if p.io_timeout_secs.is_some() {
            self.proxy.io_timeout_secs = p.io_timeout_secs;
        }
        if p.connect_timeout_secs.is_some() {
            self.proxy.connect_timeout_secs = p.connect_timeout_secs;
        }
        if p.max_connections.is_some() {
            self.proxy.max_connections = p.max_connections;
        }

        if other.policy.blocklist_path.is_some() {
            self.policy.blocklist_path = other.policy.blocklist_path;
        }
        if other.policy.redirects_path.is_some() {
            self.policy.redirects_path = other.policy.redirects_path;
        }
        self
    }
}
