/// Audio capture module
///
/// A frame source yields fixed-size blocks of mono 16-bit PCM. The live
/// source is fed by a cpal input callback through a lock-free ring buffer;
/// the WAV source replays a recording through the same interface.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Ring capacity, in frames, between the audio callback and the reader
pub const RING_FRAMES: usize = 8;

/// How long a blocked reader sleeps before checking the ring again
const READ_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No default input device available")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported input configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to query audio devices: {0}")]
    Enumerate(String),

    #[error("Failed to build audio stream: {0}")]
    Stream(String),

    #[error("Failed to start stream: {0}")]
    Play(String),

    #[error("Input stream failed: {0}")]
    Disconnected(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Source closed")]
    Closed,
}

impl CaptureError {
    /// Errors after which no further frame will ever arrive
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Closed | CaptureError::Disconnected(_))
    }
}

/// Which input device to open
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    #[default]
    Default,
    Index(usize),
    Name(String),
}

impl FromStr for DeviceSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("default") || s == "-1" {
            return Ok(DeviceSelector::Default);
        }
        Ok(match s.parse::<usize>() {
            Ok(index) => DeviceSelector::Index(index),
            Err(_) => DeviceSelector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Index(index) => write!(f, "#{}", index),
            DeviceSelector::Name(name) => write!(f, "{:?}", name),
        }
    }
}

/// Parameters a frame source is opened with
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub device: DeviceSelector,
}

/// Blocking source of fixed-size audio frames
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource {
    /// Fill `frame` completely, blocking until enough audio is available
    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError>;

    /// Samples discarded so far because the reader fell behind
    fn dropped_samples(&self) -> u64 {
        0
    }
}

/// Opens frame sources on the detection thread
pub trait SourceOpener: Send + Sync {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError>;
}

impl<F> SourceOpener for F
where
    F: Fn(&CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync,
{
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        self(config)
    }
}

/// Description of an input device
#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// List input devices of the default host
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|device| device.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::Enumerate(e.to_string()))?;

    Ok(devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
            let is_default = default_name.as_deref() == Some(name.as_str());
            InputDeviceInfo {
                index,
                name,
                is_default,
            }
        })
        .collect())
}

fn select_device(selector: &DeviceSelector) -> Result<Device, CaptureError> {
    let host = cpal::default_host();

    match selector {
        DeviceSelector::Default => host.default_input_device().ok_or(CaptureError::NoInputDevice),
        DeviceSelector::Index(index) => host
            .input_devices()
            .map_err(|e| CaptureError::Enumerate(e.to_string()))?
            .nth(*index)
            .ok_or_else(|| CaptureError::DeviceNotFound(format!("#{}", index))),
        DeviceSelector::Name(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Enumerate(e.to_string()))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.clone())),
    }
}

/// Pick a supported input configuration running at `sample_rate`,
/// preferring integer samples, then float, with the fewest channels
fn select_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), CaptureError> {
    let rate = cpal::SampleRate(sample_rate);

    let best = device
        .supported_input_configs()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter(|range| format_rank(range.sample_format()).is_some())
        .min_by_key(|range| (format_rank(range.sample_format()), range.channels()))
        .ok_or_else(|| {
            CaptureError::UnsupportedConfig(format!("no input config at {} Hz", sample_rate))
        })?;

    let supported = best.with_sample_rate(rate);
    let format = supported.sample_format();
    Ok((supported.config(), format))
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::I32 => Some(2),
        SampleFormat::U16 => Some(3),
        _ => None,
    }
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Stream error raised by the audio callback, waiting for the reader
type FaultSlot = Arc<Mutex<Option<CaptureError>>>;

/// Opens the live input device through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOpener;

impl SourceOpener for CpalOpener {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(CpalSource::open(config)?))
    }
}

/// Live capture from an input device
///
/// Owns the cpal stream; the device is released when this is dropped.
pub struct CpalSource {
    _stream: cpal::Stream,
    ring: FrameRing,
}

impl CpalSource {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device = select_device(&config.device)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
        let (stream_config, format) = select_config(&device, config.sample_rate)?;

        info!(
            "Opening input device {:?}: {} Hz, {} channel(s), {:?}",
            device_name, stream_config.sample_rate.0, stream_config.channels, format
        );

        let capacity = config.frame_size * RING_FRAMES;
        let (producer, consumer) = RingBuffer::new(capacity).split();
        let ring = FrameRing::new(consumer);

        let stream = match format {
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, producer, &ring)?,
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, producer, &ring)?,
            SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, producer, &ring)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, producer, &ring)?,
            other => {
                return Err(CaptureError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };

        stream.play().map_err(|e| CaptureError::Play(e.to_string()))?;
        debug!("Capture ring: {} samples", capacity);

        Ok(Self {
            _stream: stream,
            ring,
        })
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: RingProducer,
    ring: &FrameRing,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    AudioSample: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let dropped = ring.dropped.clone();
    let fault = ring.fault.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let overrun = push_first_channel(&mut producer, data, channels);
                if overrun > 0 {
                    dropped.fetch_add(overrun, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
                report_fault(&fault, stream_fault(&err));
            },
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))
}

/// Push the first channel of an interleaved buffer into the ring
///
/// Returns how many samples did not fit; a full ring drops the newest ones.
fn push_first_channel<T, P>(producer: &mut P, data: &[T], channels: usize) -> u64
where
    T: Sample,
    AudioSample: FromSample<T>,
    P: Producer<Item = AudioSample>,
{
    let mut dropped = 0;
    for frame in data.chunks(channels.max(1)) {
        if producer.try_push(AudioSample::from_sample(frame[0])).is_err() {
            dropped += 1;
        }
    }
    dropped
}

/// Only a vanished device ends capture; backend errors are recoverable
fn stream_fault(err: &cpal::StreamError) -> CaptureError {
    match err {
        cpal::StreamError::DeviceNotAvailable => CaptureError::Disconnected(err.to_string()),
        _ => CaptureError::Stream(err.to_string()),
    }
}

fn report_fault(slot: &Mutex<Option<CaptureError>>, fault: CaptureError) {
    let mut pending = slot.lock();
    // A pending disconnect is never overwritten
    if !pending.as_ref().is_some_and(CaptureError::is_fatal) {
        *pending = Some(fault);
    }
}

/// Reader side of the capture ring
///
/// A recoverable stream error is reported once, on the next read. A
/// disconnect is reported on every read from then on.
struct FrameRing {
    consumer: RingConsumer,
    dropped: Arc<AtomicU64>,
    fault: FaultSlot,
    disconnected: Option<String>,
}

impl FrameRing {
    fn new(consumer: RingConsumer) -> Self {
        Self {
            consumer,
            dropped: Arc::new(AtomicU64::new(0)),
            fault: Arc::new(Mutex::new(None)),
            disconnected: None,
        }
    }

    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError> {
        loop {
            if let Some(message) = &self.disconnected {
                return Err(CaptureError::Disconnected(message.clone()));
            }

            if let Some(fault) = self.fault.lock().take() {
                if let CaptureError::Disconnected(message) = &fault {
                    self.disconnected = Some(message.clone());
                }
                return Err(fault);
            }

            if self.consumer.occupied_len() >= frame.len() {
                let read = self.consumer.pop_slice(frame);
                debug_assert_eq!(read, frame.len());
                return Ok(());
            }

            thread::sleep(READ_POLL_INTERVAL);
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSource for CpalSource {
    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError> {
        self.ring.read_frame(frame)
    }

    fn dropped_samples(&self) -> u64 {
        self.ring.dropped_samples()
    }
}

/// Replays a WAV recording frame by frame
///
/// Only the first channel is used. The last partial frame is zero-padded,
/// after which every read returns [`CaptureError::Closed`].
pub struct WavSource {
    samples: Vec<AudioSample>,
    position: usize,
    pacing: Option<Duration>,
}

impl WavSource {
    /// Open `path`, requiring its sample rate to equal `sample_rate`
    pub fn open<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self, CaptureError> {
        let mut reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.sample_rate != sample_rate {
            return Err(CaptureError::UnsupportedConfig(format!(
                "{} is {} Hz, expected {} Hz",
                path.as_ref().display(),
                spec.sample_rate,
                sample_rate
            )));
        }

        let channels = usize::from(spec.channels.max(1));
        let interleaved: Vec<AudioSample> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(AudioSample::from_sample))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(CaptureError::UnsupportedConfig(format!(
                    "{:?} samples with {} bits",
                    format, bits
                )))
            }
        };

        let samples: Vec<AudioSample> = interleaved.into_iter().step_by(channels).collect();

        debug!(
            "Loaded {} samples ({:.2}s) from {}",
            samples.len(),
            samples.len() as f64 / sample_rate as f64,
            path.as_ref().display()
        );

        Ok(Self {
            samples,
            position: 0,
            pacing: None,
        })
    }

    /// Sleep `frame_duration` per read, as a live device would block
    pub fn paced(mut self, frame_duration: Duration) -> Self {
        self.pacing = Some(frame_duration);
        self
    }

    /// Samples not yet read
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl FrameSource for WavSource {
    fn read_frame(&mut self, frame: &mut [AudioSample]) -> Result<(), CaptureError> {
        if self.remaining() == 0 {
            return Err(CaptureError::Closed);
        }

        if let Some(pause) = self.pacing {
            thread::sleep(pause);
        }

        let take = frame.len().min(self.remaining());
        frame[..take].copy_from_slice(&self.samples[self.position..self.position + take]);
        frame[take..].fill(0);
        self.position += take;

        Ok(())
    }
}

/// Opens a paced [`WavSource`] in place of the input device
#[derive(Debug, Clone)]
pub struct WavOpener {
    pub path: PathBuf,
}

impl SourceOpener for WavOpener {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        let frame_duration =
            Duration::from_secs_f64(config.frame_size as f64 / config.sample_rate as f64);
        let source = WavSource::open(&self.path, config.sample_rate)?.paced(frame_duration);
        if config.device != DeviceSelector::Default {
            warn!("Replaying {}, ignoring device {}", self.path.display(), config.device);
        }
        Ok(Box::new(source))
    }
}
