//! Configuration loading and defaults.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path of the SQLite journal database. Defaults to `nbsync.db` in the
    /// working directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Controller connection and journal tunables.
    #[serde(default)]
    pub odl: OdlConfig,
}

/// The single `[odl]` option group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdlConfig {
    /// Base URL of the controller's RESTCONF/JSON northbound interface.
    pub url: String,
    pub username: String,
    pub password: String,

    /// HTTP request timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Periodic tick that sets the worker's sync event, seconds.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: u64,

    /// Per-entry retry ceiling before an entry is marked failed.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Age after which a processing lease is considered stuck, seconds.
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout: u64,

    /// Cadence of the maintenance periodic task, seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,

    /// Seconds to keep completed rows. `-1` keeps them forever, `0` deletes
    /// each row in the same transaction that completes it.
    #[serde(default = "default_completed_rows_retention")]
    pub completed_rows_retention: i64,

    /// Static override of the controller feature set. When absent the
    /// feature list is probed over RESTCONF.
    #[serde(default)]
    pub odl_features: Option<Vec<String>>,

    /// Interval between feature-probe attempts, seconds.
    #[serde(default = "default_odl_features_retry_interval")]
    pub odl_features_retry_interval: u64,

    /// Poll/retry cadence for RESTCONF streams, seconds.
    #[serde(default = "default_restconf_poll_interval")]
    pub restconf_poll_interval: u64,

    /// Substitute the in-memory transport for the REST client.
    #[serde(default)]
    pub enable_lightweight_testing: bool,

    /// RESTCONF path of the controller's hostconfig list. Recognized for
    /// compatibility; hostconfig ingestion is an external collaborator.
    #[serde(default = "default_odl_hostconf_uri")]
    pub odl_hostconf_uri: String,

    /// Hostconfig ingestion strategy (WebSocket vs. poll). Recognized for
    /// compatibility; see `odl_hostconf_uri`.
    #[serde(default = "default_enable_websocket_pseudo_agentdb")]
    pub enable_websocket_pseudo_agentdb: bool,
}

fn default_database_path() -> String {
    "nbsync.db".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_sync_timeout() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    5
}

fn default_processing_timeout() -> u64 {
    100
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_completed_rows_retention() -> i64 {
    600
}

fn default_odl_features_retry_interval() -> u64 {
    5
}

fn default_restconf_poll_interval() -> u64 {
    30
}

fn default_odl_hostconf_uri() -> String {
    "/restconf/operational/neutron:neutron/hostconfigs".to_string()
}

fn default_enable_websocket_pseudo_agentdb() -> bool {
    true
}

impl Default for OdlConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: default_timeout(),
            sync_timeout: default_sync_timeout(),
            retry_count: default_retry_count(),
            processing_timeout: default_processing_timeout(),
            maintenance_interval: default_maintenance_interval(),
            completed_rows_retention: default_completed_rows_retention(),
            odl_features: None,
            odl_features_retry_interval: default_odl_features_retry_interval(),
            restconf_poll_interval: default_restconf_poll_interval(),
            enable_lightweight_testing: false,
            odl_hostconf_uri: default_odl_hostconf_uri(),
            enable_websocket_pseudo_agentdb: default_enable_websocket_pseudo_agentdb(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if !self.odl.enable_lightweight_testing && self.odl.url.is_empty() {
            return Err(Error::Config("odl.url must be set".into()));
        }
        if self.odl.retry_count == 0 {
            return Err(Error::Config("odl.retry_count must be at least 1".into()));
        }
        Ok(())
    }
}

impl OdlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_timeout)
    }

    pub fn maintenance_cadence(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval)
    }
}
