//! Clap Detector - double-clap gesture detection over live audio
//!
//! This library provides:
//! - Butterworth band-pass filtering of fixed-size frames
//! - Peak-threshold clap detection and double-clap pairing
//! - Live capture via cpal, or replay from WAV files
//! - An HTTP polling API for browser front ends

pub mod capture;
pub mod config;
pub mod detector;
pub mod filter;
pub mod gesture;
pub mod server;

// Re-export main types
pub use capture::{
    list_input_devices, AudioSample, CaptureConfig, CaptureError, CpalOpener, DeviceSelector,
    FrameSource, InputDeviceInfo, SourceOpener, WavOpener, WavSource,
};
pub use config::{ConfigError, DetectorConfig, ServerConfig};
pub use detector::{
    scan, ClapDetector, DetectorError, DetectorStats, FrameAnalysis, FrameAnalyzer,
    FrameDetector, FrameOutcome, ScanReport,
};
pub use filter::{FilterCoefficients, FilterError};
pub use gesture::{DoubleClapFlag, DoubleClapTracker};
pub use server::{router, serve, AppState};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clap_detector=info,clap_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
