/// Band-pass filter module
///
/// Digital Butterworth band-pass design and a stateless IIR application over
/// a single frame. Every `apply` call starts from a zero initial condition.

use crate::capture::AudioSample;
use num_complex::Complex64;
use std::f64::consts::PI;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Invalid filter parameters: {0}")]
    InvalidParameters(String),
}

/// Feed-forward (`b`) and feed-back (`a`) coefficients, `a[0] == 1`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoefficients {
    b: Vec<f64>,
    a: Vec<f64>,
}

impl FilterCoefficients {
    pub fn feed_forward(&self) -> &[f64] {
        &self.b
    }

    pub fn feed_back(&self) -> &[f64] {
        &self.a
    }

    /// Number of delay elements the filter needs
    pub fn order(&self) -> usize {
        self.a.len() - 1
    }
}

/// Design a Butterworth band-pass filter
///
/// `order` is the order of the low-pass prototype, so the resulting filter
/// has `2 * order` poles and `2 * order + 1` coefficients per vector.
pub fn design(
    low_cut_hz: f64,
    high_cut_hz: f64,
    sample_rate: f64,
    order: usize,
) -> Result<FilterCoefficients, FilterError> {
    if order == 0 {
        return Err(FilterError::InvalidParameters(
            "order must be at least 1".to_string(),
        ));
    }

    let nyquist = sample_rate / 2.0;
    let band_ok = low_cut_hz.is_finite()
        && high_cut_hz.is_finite()
        && sample_rate.is_finite()
        && 0.0 < low_cut_hz
        && low_cut_hz < high_cut_hz
        && high_cut_hz < nyquist;

    if !band_ok {
        return Err(FilterError::InvalidParameters(format!(
            "band must satisfy 0 < low < high < sample_rate/2, got low={} high={} sample_rate={}",
            low_cut_hz, high_cut_hz, sample_rate
        )));
    }

    // Pre-warp the band edges for the bilinear transform
    let fs2 = 2.0 * sample_rate;
    let warped_low = fs2 * (PI * low_cut_hz / sample_rate).tan();
    let warped_high = fs2 * (PI * high_cut_hz / sample_rate).tan();
    let bandwidth = warped_high - warped_low;
    let center = (warped_low * warped_high).sqrt();

    // Analog prototype poles on the left half of the unit circle
    let n = order as f64;
    let prototype = (0..order).map(|k| {
        let theta = PI * (2.0 * k as f64 + 1.0 + n) / (2.0 * n);
        Complex64::from_polar(1.0, theta)
    });

    // Low-pass to band-pass: each prototype pole splits into a pair
    let mut analog_poles = Vec::with_capacity(2 * order);
    for pole in prototype {
        let scaled = pole * (bandwidth / 2.0);
        let offset = (scaled * scaled - center * center).sqrt();
        analog_poles.push(scaled + offset);
        analog_poles.push(scaled - offset);
    }

    // Bilinear transform. The band-pass has `order` zeros at s = 0 (z = 1)
    // and `order` zeros at infinity (z = -1).
    let fs2c = Complex64::new(fs2, 0.0);
    let digital_poles: Vec<Complex64> = analog_poles
        .iter()
        .map(|&p| (fs2c + p) / (fs2c - p))
        .collect();

    let mut digital_zeros = vec![Complex64::new(1.0, 0.0); order];
    digital_zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(order));

    let denominator = analog_poles
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, &p| acc * (fs2c - p));
    let gain = (bandwidth.powi(order as i32) * fs2.powi(order as i32) / denominator).re;

    let b: Vec<f64> = poly(&digital_zeros).iter().map(|c| c.re * gain).collect();
    let a: Vec<f64> = poly(&digital_poles).iter().map(|c| c.re).collect();

    debug!(
        "Designed band-pass {}-{} Hz @ {} Hz, order {}: b={:?} a={:?}",
        low_cut_hz, high_cut_hz, sample_rate, order, b, a
    );

    Ok(FilterCoefficients { b, a })
}

/// Expand monic polynomial coefficients (descending powers) from its roots
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for &root in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * root;
        }
        coeffs = next;
    }
    coeffs
}

/// Filter one frame (transposed direct form II, zero initial state)
pub fn apply(coefficients: &FilterCoefficients, frame: &[AudioSample]) -> Vec<f64> {
    let b = &coefficients.b;
    let a = &coefficients.a;
    let taps = a.len();
    let mut state = vec![0.0f64; taps - 1];

    frame
        .iter()
        .map(|&sample| {
            let x = sample as f64;
            let y = b[0] * x + state[0];
            for i in 0..taps - 2 {
                state[i] = b[i + 1] * x + state[i + 1] - a[i + 1] * y;
            }
            state[taps - 2] = b[taps - 1] * x - a[taps - 1] * y;
            y
        })
        .collect()
}

/// Largest absolute value in a filtered frame (0.0 when empty)
pub fn peak_amplitude(filtered: &[f64]) -> f64 {
    filtered.iter().fold(0.0f64, |peak, &y| peak.max(y.abs()))
}
