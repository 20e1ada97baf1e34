use crate::daq::{AcquisitionSetup, ChannelSetup};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Acquisition rate used when nothing else is configured. It doubles as the audio sample rate.
pub const DEFAULT_FREQUENCY_HZ: f64 = 192_000.0;
/// Channel range is `RANGE_PER_AMPLITUDE * amplitude` volts.
pub const RANGE_PER_AMPLITUDE: f64 = 5.0;
/// Time the input offset needs to stabilize after configuration.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Failed to read env file {path}: {reason}")]
    EnvFile { path: String, reason: String },
}

/// Runtime configuration for the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// DAQ device to open, -1 for the first available one
    pub device_index: i32,
    /// Sample rate for acquisition and playback
    pub frequency_hz: f64,
    pub amplitude_volts: f64,
    pub offset_volts: f64,
    pub settle: Duration,
    /// Override for the vendor driver location
    pub library_path: Option<PathBuf>,
    /// Output device number (1-based) or exact name; prompts when unset
    pub output_device: Option<String>,
    /// Optional WAV file receiving a copy of the stream
    pub record_path: Option<PathBuf>,
    /// Sleep between polls that returned no samples
    pub poll_interval: Duration,
    /// Playback buffer length in milliseconds
    pub buffer_ms: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_index: -1,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            amplitude_volts: 1.0,
            offset_volts: 0.0,
            settle: DEFAULT_SETTLE,
            library_path: None,
            output_device: None,
            record_path: None,
            poll_interval: Duration::ZERO,
            buffer_ms: 500,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `.env` (if present) and `DWF_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an explicit env file, then the process environment
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup, starting from the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "DWF_DEVICE_INDEX")? {
            config.device_index = v;
        }
        if let Some(v) = parse_var(&lookup, "DWF_FREQUENCY_HZ")? {
            config.frequency_hz = v;
        }
        if let Some(v) = parse_var(&lookup, "DWF_AMPLITUDE")? {
            config.amplitude_volts = v;
        }
        if let Some(v) = parse_var(&lookup, "DWF_OFFSET")? {
            config.offset_volts = v;
        }
        if let Some(v) = parse_var::<_, f64>(&lookup, "DWF_SETTLE_SECS")? {
            config.settle = secs_to_duration("DWF_SETTLE_SECS", v)?;
        }
        if let Some(v) = parse_var(&lookup, "DWF_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "DWF_BUFFER_MS")? {
            config.buffer_ms = v;
        }
        config.library_path = non_empty(&lookup, "DWF_LIBRARY").map(PathBuf::from);
        config.output_device = non_empty(&lookup, "DWF_OUTPUT_DEVICE");
        config.record_path = non_empty(&lookup, "DWF_RECORD").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges the driver and audio backend would otherwise reject late
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frequency_hz.is_finite() || self.frequency_hz < 1.0 {
            return Err(invalid("frequency", "must be at least 1 Hz"));
        }
        if self.frequency_hz > u32::MAX as f64 {
            return Err(invalid("frequency", "does not fit an audio sample rate"));
        }
        if !self.amplitude_volts.is_finite() || self.amplitude_volts <= 0.0 {
            return Err(invalid("amplitude", "must be a positive voltage"));
        }
        if !self.offset_volts.is_finite() {
            return Err(invalid("offset", "must be a finite voltage"));
        }
        if self.device_index < -1 {
            return Err(invalid("device index", "must be -1 or a device number"));
        }
        if self.buffer_ms == 0 {
            return Err(invalid("buffer", "must be at least 1 ms"));
        }
        Ok(())
    }

    /// Audio sample rate matching the acquisition frequency
    pub fn sample_rate(&self) -> u32 {
        self.frequency_hz.round() as u32
    }

    /// Two-channel record-mode acquisition with an infinite record length
    pub fn acquisition_setup(&self) -> AcquisitionSetup {
        let channel = |index| ChannelSetup {
            index,
            range_volts: RANGE_PER_AMPLITUDE * self.amplitude_volts,
            offset_volts: self.offset_volts,
        };
        AcquisitionSetup {
            channels: vec![channel(0), channel(1)],
            frequency_hz: self.frequency_hz,
            record_length_secs: -1.0,
        }
    }
}

/// Convert fractional seconds from config into a `Duration`
pub fn secs_to_duration(var: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(var, &e.to_string()))
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("'{}': {}", raw, e))),
        None => Ok(None),
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}
