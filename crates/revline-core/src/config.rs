//! Configuration
//!
//! All tunables for the adapter session, signal conditioning and sound
//! modulation. Stored as JSON; every field has a default so partial files
//! load cleanly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    DEFAULT_BAUD_RATE, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, MAX_MISS_THRESHOLD,
    MIN_MISS_THRESHOLD,
};

/// Errors while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Adapter session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Response timeout for regular commands
    pub command_timeout_ms: u64,
    /// Response timeout for the reset command (the banner is slow)
    pub reset_timeout_ms: u64,
    /// Pause after reset before the next command
    pub reset_settle_ms: u64,
    /// Pause between polling ticks
    pub poll_interval_ms: u64,
    /// Consecutive polling misses before re-initializing (3..=5)
    pub miss_threshold: u32,
    /// Rescan and reconnect automatically after failures and link loss
    pub auto_reconnect: bool,
    /// Delay before an automatic reconnect attempt
    pub reconnect_delay_ms: u64,
    /// `ATSP` protocol number; 6 = ISO 15765-4 CAN 11-bit 500 kbaud
    pub protocol: String,
    /// `ATSH` request header; 7E4 addresses the BMS ECU
    pub header: String,
    /// Baud rate for serial adapters
    pub baud_rate: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            reset_timeout_ms: 2500,
            reset_settle_ms: 1000,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            miss_threshold: MIN_MISS_THRESHOLD,
            auto_reconnect: true,
            reconnect_delay_ms: 2000,
            protocol: "6".to_string(),
            header: "7E4".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl AdapterConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// RPM smoothing and throttle estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// EMA blending factor for the newest sample
    pub smoothing_alpha: f64,
    /// Samples kept in the history
    pub history_capacity: usize,
    /// Samples used for the throttle rate estimate
    pub throttle_window: usize,
    /// RPM/s that maps to full throttle
    pub max_rate_rpm_per_sec: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.35,
            history_capacity: 32,
            throttle_window: 5,
            max_rate_rpm_per_sec: 2000.0,
        }
    }
}

/// Sound modulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulationConfig {
    /// RPM where the low/high crossfade begins
    pub band_start_rpm: f64,
    /// RPM where the high layers are fully in
    pub band_end_rpm: f64,
    /// Fraction of the soft limiter where the limiter layer starts fading in
    pub limiter_soft_ratio: f64,
    /// Modulation ticks per second
    pub tick_hz: u32,
    /// Initial master volume (0..=1)
    pub master_volume: f64,
}

impl Default for ModulationConfig {
    fn default() -> Self {
        Self {
            band_start_rpm: 3000.0,
            band_end_rpm: 6500.0,
            limiter_soft_ratio: 0.93,
            tick_hz: 60,
            master_volume: 0.8,
        }
    }
}

impl ModulationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevlineConfig {
    pub adapter: AdapterConfig,
    pub signal: SignalConfig,
    pub modulation: ModulationConfig,
    /// Built-in profile selected at start-up
    pub profile: String,
}

impl Default for RevlineConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            signal: SignalConfig::default(),
            modulation: ModulationConfig::default(),
            profile: "inline4".to_string(),
        }
    }
}

impl RevlineConfig {
    /// Default location: `<config dir>/revline/config.json`
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::config_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Could not find config directory")
            })?;
        Ok(base.join("revline").join("config.json"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: RevlineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults if the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.adapter;
        if a.command_timeout_ms == 0 || a.reset_timeout_ms == 0 {
            return Err(ConfigError::Invalid("command timeouts must be non-zero".into()));
        }
        if a.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero".into()));
        }
        if !(MIN_MISS_THRESHOLD..=MAX_MISS_THRESHOLD).contains(&a.miss_threshold) {
            return Err(ConfigError::Invalid(format!(
                "miss_threshold must be between {} and {}",
                MIN_MISS_THRESHOLD, MAX_MISS_THRESHOLD
            )));
        }
        if a.protocol.is_empty() || a.header.is_empty() {
            return Err(ConfigError::Invalid("protocol and header are required".into()));
        }

        let s = &self.signal;
        if !(s.smoothing_alpha > 0.0 && s.smoothing_alpha <= 1.0) {
            return Err(ConfigError::Invalid("smoothing_alpha must be in (0, 1]".into()));
        }
        if s.throttle_window < 2 || s.history_capacity < s.throttle_window {
            return Err(ConfigError::Invalid(
                "throttle_window must be >= 2 and fit in history_capacity".into(),
            ));
        }
        if s.max_rate_rpm_per_sec <= 0.0 {
            return Err(ConfigError::Invalid("max_rate_rpm_per_sec must be positive".into()));
        }

        let m = &self.modulation;
        if m.band_end_rpm <= m.band_start_rpm {
            return Err(ConfigError::Invalid("band_end_rpm must exceed band_start_rpm".into()));
        }
        if m.tick_hz == 0 {
            return Err(ConfigError::Invalid("tick_hz must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&m.master_volume) {
            return Err(ConfigError::Invalid("master_volume must be in [0, 1]".into()));
        }

        Ok(())
    }
}
