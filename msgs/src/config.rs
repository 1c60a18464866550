//! LAN settings, read from the same JSON config file the rest of the tool uses.

use std::{fs, io, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read (#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse (#[from] serde_json::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_lan_port() -> u16 { 8080 }
fn default_discovery_port() -> u16 { 8081 }
fn default_true() -> bool { true }
fn default_sync_interval() -> f64 { 1.0 }
fn default_lock_ttl() -> f64 { 300.0 }
fn default_liveness_timeout() -> f64 { 15.0 }
fn default_beacon_interval() -> f64 { 2.0 }
fn default_heartbeat_interval() -> f64 { 3.0 }
fn default_resync_threshold() -> u64 { 64 }
fn default_malformed_tolerance() -> u32 { 5 }
fn default_progress_file() -> PathBuf { PathBuf::from("progress.json") }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanConfig {
    #[serde(default)]
    pub lan_enabled: bool,
    #[serde(default = "default_lan_port")]
    pub lan_port: u16,
    #[serde(default = "default_discovery_port")]
    pub lan_discovery_port: u16,
    #[serde(default = "default_true")]
    pub lan_auto_sync: bool,
    /// Seconds between delta flushes.
    #[serde(default = "default_sync_interval")]
    pub lan_sync_interval: f64,
    #[serde(default)]
    pub lan_host_mode: bool,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: f64,
    #[serde(default = "default_liveness_timeout")]
    pub peer_liveness_timeout: f64,
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_resync_threshold")]
    pub resync_threshold: u64,
    #[serde(default = "default_malformed_tolerance")]
    pub malformed_tolerance: u32,
    #[serde(default)]
    pub lan_mdns: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,
}

impl Default for LanConfig {
    fn default() -> Self {
        LanConfig {
            lan_enabled: false,
            lan_port: default_lan_port(),
            lan_discovery_port: default_discovery_port(),
            lan_auto_sync: true,
            lan_sync_interval: default_sync_interval(),
            lan_host_mode: false,
            lock_ttl: default_lock_ttl(),
            peer_liveness_timeout: default_liveness_timeout(),
            beacon_interval: default_beacon_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            resync_threshold: default_resync_threshold(),
            malformed_tolerance: default_malformed_tolerance(),
            lan_mdns: false,
            display_name: None,
            progress_file: default_progress_file(),
        }
    }
}

/// Which side of a session a binary plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Durations derived from [`LanConfig`], validated.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTimings {
    /// `None` when auto sync is off; deltas then wait for a manual flush.
    pub sync_interval: Option<Duration>,
    pub lock_ttl: Duration,
    pub peer_liveness_timeout: Duration,
    pub beacon_interval: Duration,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub resync_threshold: u64,
    pub malformed_tolerance: u32,
}

impl Default for SessionTimings {
    fn default() -> Self {
        // defaults are always valid
        match LanConfig::default().timings() {
            Ok(timings) => timings,
            Err(_) => unreachable!("default lan config is valid"),
        }
    }
}

fn seconds(key: &'static str, value: f64) -> ConfigResult<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid { key, reason: format!("expected a positive number of seconds, got {value}") });
    }
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid { key, reason: e.to_string() })
}

impl LanConfig {
    /// Loads the config, falling back to defaults when the file is missing.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<LanConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(LanConfig::default());
        }
        let contents = fs::read_to_string(path)?;
        let config: LanConfig = serde_json::from_str(&contents)?;
        config.timings()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn timings(&self) -> ConfigResult<SessionTimings> {
        let lock_ttl = seconds("lock_ttl", self.lock_ttl)?;
        let peer_liveness_timeout = seconds("peer_liveness_timeout", self.peer_liveness_timeout)?;
        let heartbeat_interval = seconds("heartbeat_interval", self.heartbeat_interval)?;
        if heartbeat_interval >= peer_liveness_timeout {
            return Err(ConfigError::Invalid {
                key: "heartbeat_interval",
                reason: "must be shorter than peer_liveness_timeout".into(),
            });
        }
        let sync_interval = seconds("lan_sync_interval", self.lan_sync_interval)?;
        let sweep_interval = (lock_ttl.min(peer_liveness_timeout) / 4).max(Duration::from_millis(100));
        Ok(SessionTimings {
            sync_interval: self.lan_auto_sync.then_some(sync_interval),
            lock_ttl,
            peer_liveness_timeout,
            beacon_interval: seconds("beacon_interval", self.beacon_interval)?,
            heartbeat_interval,
            sweep_interval,
            resync_threshold: self.resync_threshold,
            malformed_tolerance: self.malformed_tolerance,
        })
    }

    /// `lan_enabled` gates both roles; `lan_host_mode` picks which one.
    pub fn check_role(&self, role: Role) -> ConfigResult<()> {
        if !self.lan_enabled {
            return Err(ConfigError::Invalid { key: "lan_enabled", reason: "LAN sync is turned off".into() });
        }
        match (role, self.lan_host_mode) {
            (Role::Host, false) => Err(ConfigError::Invalid {
                key: "lan_host_mode",
                reason: "this machine is set up to join a session, not host one".into(),
            }),
            (Role::Client, true) => Err(ConfigError::Invalid {
                key: "lan_host_mode",
                reason: "this machine is set up to host the session".into(),
            }),
            _ => Ok(()),
        }
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = &self.display_name {
            return name.clone();
        }
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "player".to_string())
    }
}
