//! Proxy configuration
//!
//! Loaded from TOML, then overlaid with environment variables:
//!
//! - `STORE_PROXY_MAX_BUFFERED_EVENTS`: reorder buffer bound (default: 1024)
//! - `STORE_PROXY_LOG_LEVEL`: tracing filter directive (default: info)
//! - `STORE_PROXY_LOG_JSON`: JSON log output (default: false)
//! - `STORE_PROXY_SEEDS`: simulation seeds per batch (default: 100)
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ceiling for the snapshot retry backoff.
pub const MAX_SYNC_RETRY_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Out-of-order events a proxy holds before falling back to a resync
    pub max_buffered_events: usize,
    /// Cursor page size when a caller does not pick one
    pub default_page_size: usize,
    /// First delay before retrying a failed snapshot request; doubles up to
    /// `MAX_SYNC_RETRY_MS` while failures continue
    pub sync_retry_ms: u64,
    pub logging: LogConfig,
    pub simulation: SimulationSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            max_buffered_events: 1024,
            default_page_size: 32,
            sync_retry_ms: 50,
            logging: LogConfig::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `store_proxy=debug`
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Fault profile for the simulation binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub seeds: usize,
    pub first_seed: u64,
    pub operations: usize,
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    pub reorder_probability: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            seeds: 100,
            first_seed: 0,
            operations: 200,
            drop_probability: 0.05,
            duplicate_probability: 0.05,
            reorder_probability: 0.2,
        }
    }
}

impl ProxyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, StorageError> {
        let config: ProxyConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Overlay `STORE_PROXY_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self, StorageError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StorageError> {
        if let Some(v) = lookup("STORE_PROXY_MAX_BUFFERED_EVENTS") {
            self.max_buffered_events = parse_var("STORE_PROXY_MAX_BUFFERED_EVENTS", &v)?;
        }
        if let Some(v) = lookup("STORE_PROXY_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("STORE_PROXY_LOG_JSON") {
            self.logging.json = v == "true" || v == "1";
        }
        if let Some(v) = lookup("STORE_PROXY_SEEDS") {
            self.simulation.seeds = parse_var("STORE_PROXY_SEEDS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.default_page_size == 0 {
            return Err(StorageError::Config(
                "default_page_size must be at least 1".to_string(),
            ));
        }
        if self.sync_retry_ms == 0 {
            return Err(StorageError::Config(
                "sync_retry_ms must be at least 1".to_string(),
            ));
        }
        let s = &self.simulation;
        for (name, p) in [
            ("drop_probability", s.drop_probability),
            ("duplicate_probability", s.duplicate_probability),
            ("reorder_probability", s.reorder_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(StorageError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, p
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, StorageError> {
    value
        .trim()
        .parse()
        .map_err(|_| StorageError::Config(format!("{}: cannot parse '{}'", name, value)))
}
