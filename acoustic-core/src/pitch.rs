//! # Pitch Detection Module
//!
//! Monophonic pitch detection for the tuner, intonation and lab tools.
//! Two time-domain algorithms sit behind the [`PitchDetector`] trait so
//! callers never depend on which one is active:
//!
//! - [`YinDetector`]: cumulative-mean-normalized difference with the
//!   absolute-threshold / local-minimum rule
//! - [`AutocorrelationDetector`]: trimmed autocorrelation with peak picking
//!   past the zero-lag lobe
//!
//! Both share the RMS noise gate and [`parabolic_vertex_offset`] for
//! sub-sample lag refinement.

use serde::{Deserialize, Serialize};

use crate::audio::{SampleBlock, rms};

/// Lowest frequency the detectors search for by default.
pub const DEFAULT_MIN_FREQUENCY: f32 = 60.0;
/// Highest frequency the detectors search for by default.
pub const DEFAULT_MAX_FREQUENCY: f32 = 2000.0;
/// Default YIN absolute threshold.
pub const DEFAULT_YIN_THRESHOLD: f32 = 0.15;
/// Default RMS gate below which a block is treated as silence.
pub const DEFAULT_MIN_RMS: f32 = 0.01;

/// Samples whose magnitude stays below this are trimmed from the block edges
/// before autocorrelation.
const EDGE_TRIM_THRESHOLD: f32 = 0.2;

/// A correlation peak counts as the period when it reaches this share of the
/// highest peak in the search range.
const PEAK_PICK_RATIO: f32 = 0.9;

/// The outcome of running a detector over one block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz, `None` when no reliable pitch was found.
    pub frequency_hz: Option<f32>,
    /// Confidence of the estimate (0.0 to 1.0).
    pub clarity: f32,
}

impl PitchEstimate {
    pub const NONE: PitchEstimate = PitchEstimate {
        frequency_hz: None,
        clarity: 0.0,
    };

    pub fn is_voiced(&self) -> bool {
        self.frequency_hz.is_some()
    }
}

/// Common contract of every pitch-detection strategy.
pub trait PitchDetector: Send {
    /// Estimates the fundamental of `block`.
    ///
    /// # Panics
    /// If the block length differs from the length the detector was built for.
    fn detect(&mut self, block: &SampleBlock) -> PitchEstimate;

    /// Block length this detector expects.
    fn block_size(&self) -> usize;

    fn kind(&self) -> DetectorKind;
}

/// Selects a detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Yin,
    Autocorrelation,
}

/// Tunables shared by both detectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    pub block_size: usize,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// YIN absolute threshold on the normalized difference (0.10 - 0.20).
    pub threshold: f32,
    pub min_rms: f32,
}

impl DetectorParams {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            min_frequency: DEFAULT_MIN_FREQUENCY,
            max_frequency: DEFAULT_MAX_FREQUENCY,
            threshold: DEFAULT_YIN_THRESHOLD,
            min_rms: DEFAULT_MIN_RMS,
        }
    }

    /// Lag search range `[min, max]` for `sample_rate`, clamped to `limit`.
    fn lag_range(&self, sample_rate: u32, limit: usize) -> Option<(usize, usize)> {
        let sr = sample_rate as f32;
        let min_lag = ((sr / self.max_frequency).floor() as usize).max(2);
        let max_lag = ((sr / self.min_frequency).ceil() as usize).min(limit);
        (min_lag < max_lag).then_some((min_lag, max_lag))
    }
}

/// Builds a boxed detector of the requested kind.
pub fn build_detector(kind: DetectorKind, params: DetectorParams) -> Box<dyn PitchDetector> {
    match kind {
        DetectorKind::Yin => Box::new(YinDetector::new(params)),
        DetectorKind::Autocorrelation => Box::new(AutocorrelationDetector::new(params)),
    }
}

/// Offset of the vertex of the parabola through `(-1, y0)`, `(0, y1)`, `(1, y2)`.
///
/// Returns 0.0 for a degenerate (flat) parabola. The result lies in
/// `[-0.5, 0.5]` whenever `y1` is a strict local extremum.
pub fn parabolic_vertex_offset(y0: f32, y1: f32, y2: f32) -> f32 {
    let denominator = y0 - 2.0 * y1 + y2;
    if denominator.abs() < f32::EPSILON {
        return 0.0;
    }
    (y0 - y2) / (2.0 * denominator)
}

fn assert_block_len(block: &SampleBlock, expected: usize) {
    assert_eq!(
        block.len(),
        expected,
        "pitch detector built for {} samples received a {}-sample block",
        expected,
        block.len()
    );
}

fn lag_to_frequency(sample_rate: u32, lag: f32) -> Option<f32> {
    if lag <= 0.0 {
        return None;
    }
    let frequency = sample_rate as f32 / lag;
    frequency.is_finite().then_some(frequency)
}

/// YIN pitch detector (de Cheveigné & Kawahara).
///
/// Scratch buffers are allocated once and fully overwritten on every call.
#[derive(Debug, Clone)]
pub struct YinDetector {
    params: DetectorParams,
    yin_buffer: Vec<f32>,
}

impl YinDetector {
    pub fn new(params: DetectorParams) -> Self {
        assert!(params.block_size >= 4, "block size too small for YIN");
        Self {
            params,
            yin_buffer: vec![0.0; params.block_size / 2],
        }
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.params.threshold = threshold.clamp(0.01, 0.5);
    }

    /// Difference function followed by the cumulative mean normalization,
    /// computed for lags `1..=max_lag`.
    fn compute_cmnd(&mut self, signal: &[f32], max_lag: usize) {
        let window = signal.len() / 2;
        self.yin_buffer.fill(1.0);

        for tau in 1..=max_lag {
            let mut diff = 0.0f64;
            for i in 0..window {
                let delta = (signal[i] - signal[i + tau]) as f64;
                diff += delta * delta;
            }
            self.yin_buffer[tau] = diff as f32;
        }

        let mut running_sum = 0.0f64;
        self.yin_buffer[0] = 1.0;
        for tau in 1..=max_lag {
            running_sum += self.yin_buffer[tau] as f64;
            self.yin_buffer[tau] = if running_sum > 1e-12 {
                (self.yin_buffer[tau] as f64 * tau as f64 / running_sum) as f32
            } else {
                1.0
            };
        }
    }

    /// First lag under the threshold, walked down to its local minimum.
    fn find_period(&self, min_lag: usize, max_lag: usize) -> Option<usize> {
        let mut tau = min_lag;
        while tau < max_lag {
            if self.yin_buffer[tau] < self.params.threshold {
                while tau + 1 < max_lag && self.yin_buffer[tau + 1] < self.yin_buffer[tau] {
                    tau += 1;
                }
                return Some(tau);
            }
            tau += 1;
        }
        None
    }
}

impl PitchDetector for YinDetector {
    fn detect(&mut self, block: &SampleBlock) -> PitchEstimate {
        assert_block_len(block, self.params.block_size);
        let signal = block.samples();

        if rms(signal) < self.params.min_rms {
            return PitchEstimate::NONE;
        }

        let half = signal.len() / 2;
        let Some((min_lag, max_lag)) = self.params.lag_range(block.sample_rate(), half - 1) else {
            return PitchEstimate::NONE;
        };

        self.compute_cmnd(signal, max_lag);

        let Some(period) = self.find_period(min_lag, max_lag) else {
            return PitchEstimate::NONE;
        };

        let d_prime = self.yin_buffer[period];
        let offset = parabolic_vertex_offset(
            self.yin_buffer[period - 1],
            d_prime,
            self.yin_buffer[period + 1],
        );
        let lag = period as f32 + offset;

        match lag_to_frequency(block.sample_rate(), lag) {
            Some(frequency) => PitchEstimate {
                frequency_hz: Some(frequency),
                clarity: (1.0 - d_prime).clamp(0.0, 1.0),
            },
            None => PitchEstimate::NONE,
        }
    }

    fn block_size(&self) -> usize {
        self.params.block_size
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Yin
    }
}

/// Autocorrelation pitch detector with edge trimming.
///
/// Each lag is normalized by the energy of the two overlapping segments, so
/// the shrinking overlap at longer lags does not pull the peak sharp.
#[derive(Debug, Clone)]
pub struct AutocorrelationDetector {
    params: DetectorParams,
    correlation: Vec<f32>,
    /// Prefix sums of squared samples; `energy[k]` covers `0..k`.
    energy: Vec<f64>,
}

impl AutocorrelationDetector {
    pub fn new(params: DetectorParams) -> Self {
        assert!(params.block_size >= 4, "block size too small for autocorrelation");
        Self {
            params,
            correlation: vec![0.0; params.block_size],
            energy: vec![0.0; params.block_size + 1],
        }
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Normalized correlation `c(τ) / sqrt(E_head(τ) · E_tail(τ))` for
    /// lags `0..=max_lag`.
    fn compute_normalized(&mut self, signal: &[f32], max_lag: usize) {
        let len = signal.len();
        self.energy[0] = 0.0;
        for (i, &s) in signal.iter().enumerate() {
            self.energy[i + 1] = self.energy[i] + (s * s) as f64;
        }

        self.correlation.fill(0.0);
        for tau in 0..=max_lag {
            let mut sum = 0.0f64;
            for i in 0..len - tau {
                sum += (signal[i] * signal[i + tau]) as f64;
            }
            let head = self.energy[len - tau];
            let tail = self.energy[len] - self.energy[tau];
            let norm = (head * tail).sqrt();
            self.correlation[tau] = if norm > 1e-12 { (sum / norm) as f32 } else { 0.0 };
        }
    }
}

/// Central region of `signal` between the first and last near-silent samples.
fn trim_edges(signal: &[f32]) -> &[f32] {
    let n = signal.len();
    let start = (0..n / 2)
        .find(|&i| signal[i].abs() < EDGE_TRIM_THRESHOLD)
        .unwrap_or(0);
    let end = (1..n / 2)
        .find(|&i| signal[n - i].abs() < EDGE_TRIM_THRESHOLD)
        .map_or(n, |i| n - i);
    &signal[start..end]
}

impl PitchDetector for AutocorrelationDetector {
    fn detect(&mut self, block: &SampleBlock) -> PitchEstimate {
        assert_block_len(block, self.params.block_size);

        if block.rms() < self.params.min_rms {
            return PitchEstimate::NONE;
        }

        let trimmed = trim_edges(block.samples());
        let len = trimmed.len();
        if len < 8 {
            return PitchEstimate::NONE;
        }

        // Lags stay within half the trimmed length so every lag overlaps at
        // least half of the signal.
        let Some((min_lag, max_lag)) = self.params.lag_range(block.sample_rate(), len / 2) else {
            return PitchEstimate::NONE;
        };
        self.compute_normalized(trimmed, max_lag + 1);
        let correlation = &self.correlation[..=max_lag + 1];

        // Skip the zero-lag lobe.
        let mut lobe_end = 0;
        while lobe_end < max_lag && correlation[lobe_end] > correlation[lobe_end + 1] {
            lobe_end += 1;
        }
        let search_start = lobe_end.max(min_lag);
        if search_start > max_lag {
            return PitchEstimate::NONE;
        }

        // Multiples of the period score almost as high as the period itself,
        // so take the first local maximum close to the best one.
        let peaks: Vec<usize> = (search_start..=max_lag)
            .filter(|&tau| {
                correlation[tau] >= correlation[tau - 1] && correlation[tau] > correlation[tau + 1]
            })
            .collect();
        let best = peaks
            .iter()
            .map(|&tau| correlation[tau])
            .fold(f32::NEG_INFINITY, f32::max);
        if best <= 0.0 {
            return PitchEstimate::NONE;
        }
        let Some(&peak) = peaks
            .iter()
            .find(|&&tau| correlation[tau] >= PEAK_PICK_RATIO * best)
        else {
            return PitchEstimate::NONE;
        };

        let peak_value = correlation[peak];
        let offset =
            parabolic_vertex_offset(correlation[peak - 1], peak_value, correlation[peak + 1]);
        let lag = peak as f32 + offset;

        match lag_to_frequency(block.sample_rate(), lag) {
            Some(frequency) => PitchEstimate {
                frequency_hz: Some(frequency),
                clarity: peak_value.clamp(0.0, 1.0),
            },
            None => PitchEstimate::NONE,
        }
    }

    fn block_size(&self) -> usize {
        self.params.block_size
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Autocorrelation
    }
}
