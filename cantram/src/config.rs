//! Configuration management for cantram.
//!
//! This module handles loading and validating configuration from JSON files
//! and environment variables. Every field has a default, so an empty file
//! (`{}`) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hw_trait::Bitrate;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Tram bus configuration
    pub bus: BusConfig,

    /// Relay protection settings
    pub relay: RelayConfig,

    /// Shared SPI chip settings
    pub chips: ChipConfig,
}

/// Tram bus service loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// CAN bitrate applied when the core starts
    pub bitrate: Bitrate,

    /// Deadline for one request, counted from transmission
    pub request_timeout_ms: u64,

    /// How long enumeration collects probe answers
    pub enumeration_window_ms: u64,

    /// Upper bound for a local module to answer one request
    pub module_deadline_ms: u64,

    /// Period of the module cycle (relay servicing, poll tracking)
    pub cycle_interval_ms: u64,

    /// Requests allowed to wait behind the one in flight, per address
    pub max_queued_per_address: usize,

    /// Deadline for handing a command to the service loop
    pub submit_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bitrate: Bitrate::default(),
            request_timeout_ms: 100,
            enumeration_window_ms: 250,
            module_deadline_ms: 50,
            cycle_interval_ms: 10,
            max_queued_per_address: 8,
            submit_timeout_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn enumeration_window(&self) -> Duration {
        Duration::from_millis(self.enumeration_window_ms)
    }

    pub fn module_deadline(&self) -> Duration {
        Duration::from_millis(self.module_deadline_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

/// Relay protection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Minimum time between two toggles of one relay
    pub min_dwell_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { min_dwell_ms: 100 }
    }
}

impl RelayConfig {
    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }
}

/// Shared SPI chip configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChipConfig {
    /// A burst or diagnostic snapshot younger than this is reused by the
    /// next interface reading the same chip
    pub snapshot_window_us: u64,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            snapshot_window_us: 2000,
        }
    }
}

impl ChipConfig {
    pub fn snapshot_window(&self) -> Duration {
        Duration::from_micros(self.snapshot_window_us)
    }
}

// Read a millisecond override from the environment, ignoring garbage.
fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

impl Config {
    /// Load configuration from a specific file, then apply environment
    /// overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CANTRAM_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_millis("CANTRAM_REQUEST_TIMEOUT_MS") {
            self.bus.request_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("CANTRAM_ENUMERATION_WINDOW_MS") {
            self.bus.enumeration_window_ms = ms;
        }
        if let Some(ms) = env_millis("CANTRAM_RELAY_DWELL_MS") {
            self.relay.min_dwell_ms = ms;
        }
    }

    /// Reject settings that would break the deadline model.
    pub fn validate(&self) -> Result<()> {
        let deadlines = [
            ("bus.request_timeout_ms", self.bus.request_timeout_ms),
            ("bus.enumeration_window_ms", self.bus.enumeration_window_ms),
            ("bus.module_deadline_ms", self.bus.module_deadline_ms),
            ("bus.cycle_interval_ms", self.bus.cycle_interval_ms),
            ("bus.submit_timeout_ms", self.bus.submit_timeout_ms),
        ];
        for (name, value) in deadlines {
            if value == 0 {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.bus.max_queued_per_address == 0 {
            return Err(Error::Config(
                "bus.max_queued_per_address must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bus.request_timeout(), Duration::from_millis(100));
        assert_eq!(config.bus.bitrate, Bitrate::Br500k);
        assert_eq!(config.relay.min_dwell(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "bus": { "request_timeout_ms": 20, "bitrate": "br1m" } }"#,
        )
        .unwrap();
        assert_eq!(config.bus.request_timeout_ms, 20);
        assert_eq!(config.bus.bitrate, Bitrate::Br1m);
        assert_eq!(config.bus.enumeration_window_ms, 250);
    }

    #[test]
    fn zero_deadline_is_rejected() {
        let mut config = Config::default();
        config.bus.module_deadline_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus.module_deadline_ms"));
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let mut config = Config::default();
        config.bus.max_queued_per_address = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
