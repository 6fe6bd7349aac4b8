//! Timeouts and daemon launch options.
//!
//! Loaded from a JSON file with camelCase keys; any missing key falls back
//! to its default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default bound for canFormat / format / cancel exchanges.
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;
/// Default bound for initialise / restart.
const DEFAULT_INITIALISATION_TIMEOUT_MS: u64 = 10_000;
/// A pending request older than this is stale.
const DEFAULT_STALE_THRESHOLD_MS: u64 = 30_000;
/// Best-effort bound for the ShutDownProcess message.
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1_000;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub command_timeout_ms: u64,
    pub initialisation_timeout_ms: u64,
    pub stale_threshold_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Pass `--verbose` to the daemon.
    pub verbose: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            initialisation_timeout_ms: DEFAULT_INITIALISATION_TIMEOUT_MS,
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            verbose: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse client configuration")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn initialisation_timeout(&self) -> Duration {
        Duration::from_millis(self.initialisation_timeout_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
