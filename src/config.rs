/// Configuration module
///
/// Compiled-in defaults for the clap detector and the HTTP control surface,
/// optionally overridden from `CLAP_*` environment variables at startup.

use crate::capture::{CaptureConfig, DeviceSelector};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Input sample rate (Hz)
pub const SAMPLE_RATE: u32 = 44_100;

/// Samples per analysis frame (~46ms at 44.1kHz)
pub const FRAME_SIZE: usize = 2048;

/// Peak amplitude (i16 scale, after filtering) a frame must exceed to count as a clap
pub const AMPLITUDE_THRESHOLD: f64 = 9000.0;

/// Band-pass edges covering the clap transient
pub const LOW_CUT_HZ: f64 = 1600.0;
pub const HIGH_CUT_HZ: f64 = 2300.0;

/// Butterworth prototype order
pub const FILTER_ORDER: usize = 2;

/// Maximum gap between the two claps of a double clap
pub const DOUBLE_CLAP_WINDOW: Duration = Duration::from_millis(450);

/// Sleep between loop iterations (1/120 s)
pub const LOOP_INTERVAL: Duration = Duration::from_micros(8_333);

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the clap detector
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Capture sample rate (Hz)
    pub sample_rate: u32,

    /// Samples per frame
    pub frame_size: usize,

    /// Strict lower bound on the filtered peak for a clap
    pub threshold: f64,

    /// Lower band edge (Hz)
    pub low_cut_hz: f64,

    /// Upper band edge (Hz)
    pub high_cut_hz: f64,

    /// Butterworth order (the band-pass filter has twice this many poles)
    pub filter_order: usize,

    /// Inclusive window for pairing two claps
    pub double_clap_window: Duration,

    /// Pause between detection loop iterations
    pub loop_interval: Duration,

    /// Which input device to open
    pub device: DeviceSelector,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            threshold: AMPLITUDE_THRESHOLD,
            low_cut_hz: LOW_CUT_HZ,
            high_cut_hz: HIGH_CUT_HZ,
            filter_order: FILTER_ORDER,
            double_clap_window: DOUBLE_CLAP_WINDOW,
            loop_interval: LOOP_INTERVAL,
            device: DeviceSelector::Default,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    ///
    /// Band edges are checked again by the filter designer; here we only
    /// reject values the detection loop itself cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.frame_size == 0 {
            return Err(ConfigError::Invalid(
                "frame_size must be greater than 0".to_string(),
            ));
        }

        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "threshold must be a non-negative number".to_string(),
            ));
        }

        if self.double_clap_window.is_zero() {
            return Err(ConfigError::Invalid(
                "double_clap_window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Capture parameters derived from this configuration
    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
            device: self.device.clone(),
        }
    }

    /// Duration of one frame at the configured rate
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }

    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            sample_rate: env_or("CLAP_SAMPLE_RATE", defaults.sample_rate)?,
            frame_size: env_or("CLAP_FRAME_SIZE", defaults.frame_size)?,
            threshold: env_or("CLAP_THRESHOLD", defaults.threshold)?,
            low_cut_hz: env_or("CLAP_LOW_CUT_HZ", defaults.low_cut_hz)?,
            high_cut_hz: env_or("CLAP_HIGH_CUT_HZ", defaults.high_cut_hz)?,
            filter_order: env_or("CLAP_FILTER_ORDER", defaults.filter_order)?,
            double_clap_window: env_millis_or(
                "CLAP_DOUBLE_CLAP_WINDOW_MS",
                defaults.double_clap_window,
            )?,
            loop_interval: env_millis_or("CLAP_LOOP_INTERVAL_MS", defaults.loop_interval)?,
            device: env_or("CLAP_INPUT_DEVICE", defaults.device)?,
        };

        config.validate()?;
        Ok(config)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_or("CLAP_BIND_ADDR", Self::default().bind_addr)?,
        })
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => parse_value(key, &value),
        Err(_) => Ok(default),
    }
}

fn env_millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => parse_millis(key, &value),
        Err(_) => Ok(default),
    }
}

/// Parse a non-negative millisecond count into a `Duration`
fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let ms = parse_value::<f64>(key, value)?;
    Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
