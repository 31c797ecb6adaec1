//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`config.json` in the working directory, or
//! `RELAY_CONFIG_PATH`) and then from environment overrides. A missing file means defaults,
//! which listen on `0.0.0.0:5500`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::RelayError;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay listener settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Optional HTTP status endpoint.
    #[serde(default)]
    pub status: StatusConfig,
}

/// Relay bind, port, and per-client buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Bind address (default "0.0.0.0", all interfaces).
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// TCP port (default 5500). Port 0 asks the OS for a free port.
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Maximum bytes per socket read; each read becomes one broadcast chunk (default 4096).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum concurrent clients; 0 means unlimited.
    #[serde(default)]
    pub max_clients: usize,

    /// Chunks queued per client before it is evicted as too slow (default 256).
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

/// HTTP status endpoint (health, clients, counters). Disabled unless `enabled` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_status_bind")]
    pub bind: String,

    /// Port (default 5501).
    #[serde(default = "default_status_port")]
    pub port: u16,
}

fn default_relay_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_port() -> u16 {
    5500
}

fn default_buffer_size() -> usize {
    4096
}

fn default_client_queue() -> usize {
    256
}

fn default_status_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    5501
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_relay_bind(),
            port: default_relay_port(),
            buffer_size: default_buffer_size(),
            max_clients: 0,
            client_queue: default_client_queue(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
            port: default_status_port(),
        }
    }
}

impl RelayConfig {
    /// `bind:port` as passed to address resolution.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind.trim(), self.port)
    }
}

impl StatusConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind.trim(), self.port)
    }
}

impl Config {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.relay.bind.trim().is_empty() {
            return Err(RelayError::InvalidConfig("relay.bind is empty".to_string()));
        }
        if self.relay.buffer_size == 0 {
            return Err(RelayError::InvalidConfig(
                "relay.bufferSize must be greater than 0".to_string(),
            ));
        }
        if self.relay.client_queue == 0 {
            return Err(RelayError::InvalidConfig(
                "relay.clientQueue must be greater than 0".to_string(),
            ));
        }
        if self.status.enabled {
            if self.status.bind.trim().is_empty() {
                return Err(RelayError::InvalidConfig("status.bind is empty".to_string()));
            }
            if self.status.port != 0
                && self.status.port == self.relay.port
                && self.status.bind.trim() == self.relay.bind.trim()
            {
                return Err(RelayError::InvalidConfig(format!(
                    "status endpoint and relay both use {}",
                    self.relay.addr()
                )));
            }
        }
        Ok(())
    }
}

/// Resolve config path from env or default (`config.json` in the working directory).
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Apply `RELAY_BIND` and `RELAY_PORT` on top of the file config.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(
        config,
        std::env::var("RELAY_BIND").ok().as_deref(),
        std::env::var("RELAY_PORT").ok().as_deref(),
    );
}

fn apply_overrides(config: &mut Config, bind: Option<&str>, port: Option<&str>) {
    if let Some(b) = bind.map(str::trim).filter(|b| !b.is_empty()) {
        config.relay.bind = b.to_string();
    }
    if let Some(p) = port.map(str::trim).filter(|p| !p.is_empty()) {
        match p.parse::<u16>() {
            Ok(port) => config.relay.port = port,
            Err(_) => log::warn!("ignoring RELAY_PORT={:?}: not a valid port", p),
        }
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Environment overrides are applied. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}
