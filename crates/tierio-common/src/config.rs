//! Configuration types for tierio
//!
//! This module defines configuration structures used across components.
//! Every field has a default so a partial TOML file is enough.

use crate::error::{Error, Result};
use crate::types::{BLOCKSIZE_MOD, DEFAULT_BLOCKSIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for tierio
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine configuration
    pub engine: EngineConfig,
    /// Tiering optimizer configuration
    pub tiering: TieringConfig,
    /// Plugin RPC configuration
    pub rpc: RpcConfig,
    /// Backends added at startup, in order
    pub backends: Vec<BackendConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        for backend in &self.backends {
            backend.validate()?;
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sector size in bytes (multiple of 512)
    pub blocksize: u32,
    /// Maximum number of backends
    pub max_backends: usize,
    /// Share of the logical sectors reserved as cache tier, in percent
    pub cache_percent: u8,
    /// Performance averaging window is `1 << measure_shift` samples
    pub measure_shift: u32,
    /// Lower bound of the divisor used when access counts are rescaled
    pub rescale_floor: u16,
    /// Persist the index entry after every access count update
    pub persist_access_counts: bool,
    /// Capacity of the request queue in front of the worker
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            max_backends: 16,
            cache_percent: 1,
            measure_shift: 5,
            rescale_floor: 2,
            persist_access_counts: true,
            queue_depth: 1024,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.blocksize == 0 || self.blocksize % BLOCKSIZE_MOD != 0 {
            return Err(Error::Configuration(format!(
                "blocksize {} is not a multiple of {BLOCKSIZE_MOD}",
                self.blocksize
            )));
        }
        if self.max_backends == 0 || self.max_backends > usize::from(u16::MAX) {
            return Err(Error::Configuration(format!(
                "max_backends {} out of range",
                self.max_backends
            )));
        }
        if self.cache_percent >= 100 {
            return Err(Error::Configuration(format!(
                "cache_percent {} must be below 100",
                self.cache_percent
            )));
        }
        if self.measure_shift == 0 || self.measure_shift > 16 {
            return Err(Error::Configuration(format!(
                "measure_shift {} out of range 1..=16",
                self.measure_shift
            )));
        }
        if self.rescale_floor < 2 {
            return Err(Error::Configuration("rescale_floor must be at least 2".into()));
        }
        Ok(())
    }
}

/// Tiering optimizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Run the optimizer at all
    pub enabled: bool,
    /// How long the request queue must be empty before optimizing (ms)
    pub idle_delay_ms: u64,
    /// Time slice of one incremental sort step (ms)
    pub sort_slice_ms: u64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_delay_ms: 500,
            sort_slice_ms: 5,
        }
    }
}

impl TieringConfig {
    #[must_use]
    pub const fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    #[must_use]
    pub const fn sort_slice(&self) -> Duration {
        Duration::from_millis(self.sort_slice_ms)
    }
}

/// Plugin RPC configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address plugins connect to
    pub listen: String,
    /// Requests older than this are failed with a timeout (seconds)
    pub timeout_secs: u64,
    /// Period of the timeout sweep (ms)
    pub sweep_interval_ms: u64,
    /// Re-issue a timed out synchronous request this many times
    pub max_retries: u32,
    /// Largest accepted wire frame in bytes
    pub max_frame_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9400".to_string(),
            timeout_secs: 30,
            sweep_interval_ms: 1000,
            max_retries: 1,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl RpcConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for a single backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to a file or block device (local backend)
    pub path: Option<PathBuf>,
    /// Plugin name (remote backend)
    pub plugin: Option<String>,
    /// Size in bytes to create a missing backing file with
    pub create_size: Option<u64>,
    /// Use direct I/O (`O_DIRECT` on Linux, `F_NOCACHE` on macOS)
    pub direct_io: bool,
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        match (&self.path, &self.plugin) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::Configuration(
                "a backend needs exactly one of `path` or `plugin`".into(),
            )),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
