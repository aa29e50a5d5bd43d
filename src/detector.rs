/// Clap detector main module
///
/// Runs the band-pass filter and peak threshold over each captured frame,
/// pairs claps into double claps, and exposes the result through a
/// consume-once flag. The detection loop runs on a dedicated thread that
/// owns the input stream for as long as the detector is running.

use crate::capture::{AudioSample, CaptureError, FrameSource, SourceOpener};
use crate::config::{ConfigError, DetectorConfig};
use crate::filter::{self, FilterCoefficients, FilterError};
use crate::gesture::{DoubleClapFlag, DoubleClapTracker};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(#[source] CaptureError),

    #[error("{0}")]
    InvalidParameters(#[from] FilterError),

    #[error("{0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Detector already running")]
    AlreadyRunning,

    #[error("Failed to spawn detection thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Capture(#[source] CaptureError),
}

/// Result of analyzing one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    /// Largest absolute filtered sample
    pub peak: f64,

    /// `peak` strictly above the threshold
    pub is_clap: bool,
}

/// Band-pass filter plus peak threshold
#[derive(Debug, Clone)]
pub struct FrameAnalyzer {
    coefficients: Arc<FilterCoefficients>,
    threshold: f64,
}

impl FrameAnalyzer {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let coefficients = filter::design(
            config.low_cut_hz,
            config.high_cut_hz,
            config.sample_rate as f64,
            config.filter_order,
        )?;

        Ok(Self {
            coefficients: Arc::new(coefficients),
            threshold: config.threshold,
        })
    }

    pub fn analyze(&self, frame: &[AudioSample]) -> FrameAnalysis {
        let filtered = filter::apply(&self.coefficients, frame);
        let peak = filter::peak_amplitude(&filtered);

        FrameAnalysis {
            peak,
            is_clap: self.is_clap(peak),
        }
    }

    pub fn is_clap(&self, peak: f64) -> bool {
        peak > self.threshold
    }
}

/// Outcome of one detection step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOutcome {
    pub analysis: FrameAnalysis,
    pub double_clap: bool,
}

/// Per-frame detection: read, analyze, pair
pub struct FrameDetector {
    analyzer: FrameAnalyzer,
    tracker: DoubleClapTracker,
    frame: Vec<AudioSample>,
}

impl FrameDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        Ok(Self::with_analyzer(FrameAnalyzer::new(config)?, config))
    }

    fn with_analyzer(analyzer: FrameAnalyzer, config: &DetectorConfig) -> Self {
        Self {
            analyzer,
            tracker: DoubleClapTracker::new(config.double_clap_window),
            frame: vec![0; config.frame_size],
        }
    }

    /// Read one frame and decide whether it holds a clap
    pub fn detect_clap(
        &mut self,
        source: &mut dyn FrameSource,
    ) -> Result<FrameAnalysis, CaptureError> {
        source.read_frame(&mut self.frame)?;
        Ok(self.analyzer.analyze(&self.frame))
    }

    /// Read one frame and feed the clap decision to the pairing state
    ///
    /// `now` is the time the read was issued.
    pub fn detect_double_clap(
        &mut self,
        source: &mut dyn FrameSource,
        now: Duration,
    ) -> Result<FrameOutcome, CaptureError> {
        let analysis = self.detect_clap(source)?;
        let double_clap = self.tracker.observe(analysis.is_clap, now);

        Ok(FrameOutcome {
            analysis,
            double_clap,
        })
    }

    /// Timestamp of the clap waiting for a partner
    pub fn pending_clap(&self) -> Option<Duration> {
        self.tracker.pending()
    }
}

/// Detector statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub running: bool,
    pub frames_processed: u64,
    pub claps_detected: u64,
    pub double_claps_detected: u64,
    pub dropped_samples: u64,
}

/// State shared between the detector handle and its detection thread
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    flag: DoubleClapFlag,
    frames_processed: AtomicU64,
    claps_detected: AtomicU64,
    double_claps_detected: AtomicU64,
    dropped_samples: AtomicU64,
}

/// Live double-clap detector
pub struct ClapDetector {
    config: DetectorConfig,
    analyzer: FrameAnalyzer,
    opener: Arc<dyn SourceOpener>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ClapDetector {
    /// Create a stopped detector
    ///
    /// Fails on invalid configuration or filter band; the input device is
    /// not touched until [`ClapDetector::start`].
    pub fn new(config: DetectorConfig, opener: Arc<dyn SourceOpener>) -> Result<Self, DetectorError> {
        config.validate()?;
        let analyzer = FrameAnalyzer::new(&config)?;

        info!("Initializing clap detector");
        info!(
            "Band: {}-{} Hz (order {}), threshold: {}, window: {:?}",
            config.low_cut_hz,
            config.high_cut_hz,
            config.filter_order,
            config.threshold,
            config.double_clap_window
        );
        info!(
            "Capture: {} Hz, {} samples/frame, device {}",
            config.sample_rate, config.frame_size, config.device
        );

        Ok(Self {
            config,
            analyzer,
            opener,
            shared: Arc::new(Shared::default()),
            worker: None,
        })
    }

    /// Open the input device and start the detection thread
    ///
    /// Returns once the device is open. On failure no thread is left behind.
    pub fn start(&mut self) -> Result<(), DetectorError> {
        if self.is_running() {
            warn!("Detector already running");
            return Err(DetectorError::AlreadyRunning);
        }
        self.reap_worker();

        self.shared.flag.consume();
        self.shared.running.store(true, Ordering::Release);

        let worker = DetectionWorker {
            config: self.config.clone(),
            analyzer: self.analyzer.clone(),
            opener: self.opener.clone(),
            shared: self.shared.clone(),
        };
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("clap-detector".to_string())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                DetectorError::Spawn(e)
            })?;

        let opened = ready_rx.recv().unwrap_or_else(|_| {
            Err(CaptureError::Disconnected(
                "detection thread exited before opening the device".to_string(),
            ))
        });

        match opened {
            Ok(()) => {
                self.worker = Some(handle);
                info!("Clap detector started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                if handle.join().is_err() {
                    error!("Detection thread panicked while opening the device");
                }
                error!("Failed to open input device: {}", e);
                Err(DetectorError::DeviceUnavailable(e))
            }
        }
    }

    /// Stop the detection thread and release the device
    ///
    /// Returns false if the detector was not running. Blocks until the
    /// in-flight frame completes and the thread has exited.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.worker.take() else {
            warn!("Detector not running");
            return false;
        };

        self.shared.running.store(false, Ordering::Release);

        if handle.join().is_err() {
            error!("Detection thread panicked");
        }

        info!("Clap detector stopped");
        true
    }

    /// Whether the detection loop is still running
    ///
    /// False once the loop has ended on its own, e.g. after the source closed.
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    /// Join a detection thread whose loop has already ended
    fn reap_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Detection thread panicked");
            }
            debug!("Reaped finished detection thread");
        }
    }

    /// Return and clear the double-clap flag
    pub fn consume_double_clap(&self) -> bool {
        self.shared.flag.consume()
    }

    /// Get current statistics
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            running: self.is_running(),
            frames_processed: self.shared.frames_processed.load(Ordering::Relaxed),
            claps_detected: self.shared.claps_detected.load(Ordering::Relaxed),
            double_claps_detected: self.shared.double_claps_detected.load(Ordering::Relaxed),
            dropped_samples: self.shared.dropped_samples.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

impl Drop for ClapDetector {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Everything the detection thread owns
struct DetectionWorker {
    config: DetectorConfig,
    analyzer: FrameAnalyzer,
    opener: Arc<dyn SourceOpener>,
    shared: Arc<Shared>,
}

impl DetectionWorker {
    fn run(self, ready: mpsc::SyncSender<Result<(), CaptureError>>) {
        let mut source = match self.opener.open(&self.config.capture()) {
            Ok(source) => source,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        self.detection_loop(source.as_mut());

        self.shared.running.store(false, Ordering::Release);
        drop(source);
        debug!("Input device released");
    }

    fn detection_loop(&self, source: &mut dyn FrameSource) {
        let mut detector = FrameDetector::with_analyzer(self.analyzer.clone(), &self.config);
        let origin = Instant::now();
        let mut last_dropped = 0;

        while self.shared.running.load(Ordering::Acquire) {
            let now = origin.elapsed();

            match detector.detect_double_clap(source, now) {
                Ok(outcome) => self.record(&outcome, now),
                Err(e) if e.is_fatal() => {
                    error!("Capture ended: {}", e);
                    break;
                }
                Err(e) => warn!("Skipping frame: {}", e),
            }

            let dropped = source.dropped_samples();
            if dropped > last_dropped {
                debug!("Capture overrun: {} samples dropped", dropped - last_dropped);
                last_dropped = dropped;
                self.shared.dropped_samples.store(dropped, Ordering::Relaxed);
            }

            thread::sleep(self.config.loop_interval);
        }
    }

    fn record(&self, outcome: &FrameOutcome, now: Duration) {
        let shared = &self.shared;
        let frames = shared.frames_processed.fetch_add(1, Ordering::Relaxed) + 1;

        if outcome.analysis.is_clap {
            shared.claps_detected.fetch_add(1, Ordering::Relaxed);
            debug!("Clap at {:?} (peak {:.0})", now, outcome.analysis.peak);
        }

        if outcome.double_clap {
            shared.double_claps_detected.fetch_add(1, Ordering::Relaxed);
            shared.flag.raise();
            info!("Double clap detected!");
        }

        if frames % 1000 == 0 {
            debug!(
                "Processed {} frames, {} claps, {} double claps",
                frames,
                shared.claps_detected.load(Ordering::Relaxed),
                shared.double_claps_detected.load(Ordering::Relaxed)
            );
        }
    }
}

/// Claps and double claps found in a finite recording
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub frames: u64,
    pub claps: Vec<Duration>,
    pub double_claps: Vec<Duration>,
}

/// Run detection over a finite source until it closes
///
/// Frame start offsets on the recording timeline stand in for wall-clock
/// time, so results do not depend on how fast the frames are read.
pub fn scan(source: &mut dyn FrameSource, config: &DetectorConfig) -> Result<ScanReport, DetectorError> {
    config.validate()?;
    let mut detector = FrameDetector::new(config)?;
    let mut report = ScanReport::default();

    loop {
        let now = Duration::from_secs_f64(
            (report.frames * config.frame_size as u64) as f64 / config.sample_rate as f64,
        );

        match detector.detect_double_clap(source, now) {
            Ok(outcome) => {
                report.frames += 1;
                if outcome.analysis.is_clap {
                    report.claps.push(now);
                }
                if outcome.double_clap {
                    report.double_claps.push(now);
                }
            }
            Err(CaptureError::Closed) => break,
            Err(e) => return Err(DetectorError::Capture(e)),
        }
    }

    info!(
        "Scanned {} frames: {} claps, {} double claps",
        report.frames,
        report.claps.len(),
        report.double_claps.len()
    );

    Ok(report)
}
