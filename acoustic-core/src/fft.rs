//! # Fast Fourier Transform (FFT) Module
//!
//! In-process spectral analysis for the scrolling spectrogram and the
//! resonance capture. The transform is an iterative radix-2 Cooley-Tukey FFT
//! over `rustfft`'s complex type; block lengths must be powers of two.
//!
//! ## Features
//! - Hann windowing for reduced spectral leakage
//! - dB magnitude frames for the first N/2 bins
//! - Scrolling spectrogram history
//! - Trailing-block magnitude averaging for swept-excitation captures

use std::collections::VecDeque;
use std::f32::consts::PI;

use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::audio::SampleBlock;

/// Small epsilon value to prevent log(0) in the dB conversion.
pub const EPSILON: f32 = 1e-12;

/// Hann window coefficients `0.5 * (1 - cos(2*pi*i / (N - 1)))`.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let n_minus_1 = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n_minus_1).cos()))
        .collect()
}

fn assert_power_of_two(n: usize) {
    assert!(
        n.is_power_of_two(),
        "FFT length must be a power of two, got {}",
        n
    );
}

/// Reorders `buffer` into bit-reversed index order.
fn bit_reverse_permute(buffer: &mut [Complex<f32>]) {
    let n = buffer.len();
    let bits = n.trailing_zeros();
    if bits == 0 {
        return;
    }
    for i in 0..n {
        let j = i.reverse_bits() >> (usize::BITS - bits);
        if j > i {
            buffer.swap(i, j);
        }
    }
}

/// Twiddle factors `e^{-2*pi*i*k/n}` for `k` in `0..n/2`.
///
/// # Panics
/// If `n` is not a power of two.
pub fn twiddle_table(n: usize) -> Vec<Complex<f32>> {
    assert_power_of_two(n);
    let angle = -2.0 * std::f64::consts::PI / n as f64;
    (0..n / 2)
        .map(|k| {
            let theta = angle * k as f64;
            Complex::new(theta.cos() as f32, theta.sin() as f32)
        })
        .collect()
}

/// Forward FFT in place.
///
/// # Panics
/// If `buffer.len()` is not a power of two.
pub fn fft_in_place(buffer: &mut [Complex<f32>]) {
    let twiddles = twiddle_table(buffer.len());
    fft_with_twiddles(buffer, &twiddles);
}

/// Forward FFT in place using a table from [`twiddle_table`] of the same length.
///
/// # Panics
/// If `buffer.len()` is not a power of two or the table was built for another length.
pub fn fft_with_twiddles(buffer: &mut [Complex<f32>], twiddles: &[Complex<f32>]) {
    let n = buffer.len();
    assert_power_of_two(n);
    assert_eq!(
        twiddles.len(),
        n / 2,
        "twiddle table built for {} points used on {}",
        twiddles.len() * 2,
        n
    );
    bit_reverse_permute(buffer);

    let mut len = 2;
    while len <= n {
        let half = len / 2;
        let stride = n / len;
        for start in (0..n).step_by(len) {
            for k in 0..half {
                let even = buffer[start + k];
                let odd = buffer[start + k + half] * twiddles[k * stride];
                buffer[start + k] = even + odd;
                buffer[start + k + half] = even - odd;
            }
        }
        len <<= 1;
    }
}

/// One column of the spectrogram: dB magnitudes for bins `0..N/2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFrame {
    /// Width of one bin in Hz.
    pub bin_hz: f32,
    pub magnitudes_db: Vec<f32>,
}

impl SpectrumFrame {
    pub fn len(&self) -> usize {
        self.magnitudes_db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes_db.is_empty()
    }

    /// Center frequency of `bin` in Hz.
    pub fn frequency_of(&self, bin: usize) -> f32 {
        bin as f32 * self.bin_hz
    }

    /// Index of the loudest bin, ignoring DC.
    pub fn peak_bin(&self) -> Option<usize> {
        self.magnitudes_db
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
    }

    /// Linear magnitudes recovered from the dB values.
    pub fn linear_magnitudes(&self) -> Vec<f32> {
        self.magnitudes_db
            .iter()
            .map(|&db| (10f32.powf(db / 20.0) - EPSILON).max(0.0))
            .collect()
    }

    /// Summed linear power of the bins between `low_hz` and `high_hz`.
    pub fn band_energy(&self, low_hz: f32, high_hz: f32) -> f32 {
        if self.bin_hz <= 0.0 || high_hz <= low_hz {
            return 0.0;
        }
        let first = (low_hz / self.bin_hz).ceil().max(0.0) as usize;
        let last = ((high_hz / self.bin_hz).floor() as usize).min(self.len().saturating_sub(1));
        if first > last {
            return 0.0;
        }
        self.magnitudes_db[first..=last]
            .iter()
            .map(|&db| 10f32.powf(db / 10.0))
            .sum()
    }
}

/// Windowed FFT over fixed-length blocks with pre-allocated scratch space.
#[derive(Debug, Clone)]
pub struct SpectrumAnalyzer {
    size: usize,
    window: Vec<f32>,
    twiddles: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// # Panics
    /// If `size` is not a power of two.
    pub fn new(size: usize) -> Self {
        assert_power_of_two(size);
        Self {
            size,
            window: hann_window(size),
            twiddles: twiddle_table(size),
            scratch: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Linear magnitudes of the windowed block for bins `0..N/2`.
    ///
    /// # Panics
    /// If the block length differs from the analyzer size.
    pub fn magnitudes(&mut self, block: &SampleBlock) -> Vec<f32> {
        assert_eq!(
            block.len(),
            self.size,
            "spectrum analyzer built for {} samples received a {}-sample block",
            self.size,
            block.len()
        );

        for ((slot, &sample), &w) in self
            .scratch
            .iter_mut()
            .zip(block.samples())
            .zip(&self.window)
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        fft_with_twiddles(&mut self.scratch, &self.twiddles);

        self.scratch
            .iter()
            .take(self.size / 2)
            .map(|c| c.norm()) // .norm() is sqrt(re^2 + im^2)
            .collect()
    }

    /// dB spectrum frame of one block.
    pub fn transform(&mut self, block: &SampleBlock) -> SpectrumFrame {
        let magnitudes = self.magnitudes(block);
        SpectrumFrame {
            bin_hz: block.sample_rate() as f32 / self.size as f32,
            magnitudes_db: magnitudes_to_db(&magnitudes),
        }
    }
}

/// `20 * log10(magnitude + EPSILON)` for each bin.
pub fn magnitudes_to_db(magnitudes: &[f32]) -> Vec<f32> {
    magnitudes
        .iter()
        .map(|&m| 20.0 * (m + EPSILON).log10())
        .collect()
}

/// Bounded history of spectrum columns for a scrolling spectrogram.
#[derive(Debug, Clone)]
pub struct SpectrogramHistory {
    capacity: usize,
    columns: VecDeque<SpectrumFrame>,
}

impl SpectrogramHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            columns: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, frame: SpectrumFrame) {
        if self.columns.len() == self.capacity {
            self.columns.pop_front();
        }
        self.columns.push_back(frame);
    }

    /// Columns from oldest to newest.
    pub fn columns(&self) -> impl Iterator<Item = &SpectrumFrame> {
        self.columns.iter()
    }

    pub fn latest(&self) -> Option<&SpectrumFrame> {
        self.columns.back()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }
}

/// Averaged spectrum reported by a resonance capture.
///
/// A coarse visualization aid; it carries no confidence bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumSummary {
    pub bin_hz: f32,
    pub blocks_averaged: usize,
    pub magnitudes_db: Vec<f32>,
    pub peak_frequency_hz: Option<f32>,
}

/// Keeps the linear magnitudes of the trailing `depth` blocks and averages them.
#[derive(Debug, Clone)]
pub struct ResonanceAverager {
    depth: usize,
    bin_hz: f32,
    recent: VecDeque<Vec<f32>>,
}

impl ResonanceAverager {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            bin_hz: 0.0,
            recent: VecDeque::with_capacity(depth.max(1)),
        }
    }

    pub fn push(&mut self, magnitudes: Vec<f32>, bin_hz: f32) {
        if self.recent.front().is_some_and(|m| m.len() != magnitudes.len()) {
            self.recent.clear();
        }
        if self.recent.len() == self.depth {
            self.recent.pop_front();
        }
        self.bin_hz = bin_hz;
        self.recent.push_back(magnitudes);
    }

    /// Adds the linear magnitudes of a spectrum frame.
    pub fn push_frame(&mut self, frame: &SpectrumFrame) {
        self.push(frame.linear_magnitudes(), frame.bin_hz);
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }

    /// Mean magnitude per bin over the retained blocks, in dB.
    pub fn summary(&self) -> Option<SpectrumSummary> {
        let bins = self.recent.front()?.len();
        let count = self.recent.len() as f32;
        let mut mean = vec![0.0f32; bins];
        for magnitudes in &self.recent {
            for (acc, &m) in mean.iter_mut().zip(magnitudes) {
                *acc += m / count;
            }
        }

        let peak_frequency_hz = mean
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .filter(|(_, m)| **m > 0.0)
            .map(|(i, _)| i as f32 * self.bin_hz);

        Some(SpectrumSummary {
            bin_hz: self.bin_hz,
            blocks_averaged: self.recent.len(),
            magnitudes_db: magnitudes_to_db(&mean),
            peak_frequency_hz,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::FftPlanner;

    fn test_vector(n: usize) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| {
                let x = i as f32;
                Complex::new((0.3 * x).sin() + 0.5 * (1.7 * x).cos(), 0.0)
            })
            .collect()
    }

    #[test]
    fn matches_rustfft() {
        let n = 256;
        let mut ours = test_vector(n);
        let mut reference = ours.clone();
        fft_in_place(&mut ours);
        FftPlanner::new().plan_fft_forward(n).process(&mut reference);
        for (a, b) in ours.iter().zip(&reference) {
            assert!((*a - *b).norm() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn shared_twiddles_match_reference() {
        let n = 1024;
        let twiddles = twiddle_table(n);
        assert_eq!(twiddles.len(), n / 2);
        assert!((twiddles[n / 4] - Complex::new(0.0, -1.0)).norm() < 1e-6);

        let mut reference = test_vector(n);
        FftPlanner::new().plan_fft_forward(n).process(&mut reference);
        // The same table serves repeated transforms.
        for _ in 0..2 {
            let mut ours = test_vector(n);
            fft_with_twiddles(&mut ours, &twiddles);
            for (a, b) in ours.iter().zip(&reference) {
                assert!((*a - *b).norm() < 5e-3, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    #[should_panic(expected = "twiddle table built for 512 points")]
    fn mismatched_twiddle_table_panics() {
        let twiddles = twiddle_table(512);
        let mut buffer = test_vector(1024);
        fft_with_twiddles(&mut buffer, &twiddles);
    }

    #[test]
    fn parseval_holds() {
        let n = 1024;
        let signal = test_vector(n);
        let time_energy: f32 = signal.iter().map(|c| c.norm_sqr()).sum();
        let mut spectrum = signal.clone();
        fft_in_place(&mut spectrum);
        let freq_energy: f32 = spectrum.iter().map(|c| c.norm_sqr()).sum::<f32>() / n as f32;
        assert!(((time_energy - freq_energy) / time_energy).abs() < 1e-4);
    }

    #[test]
    fn transform_is_linear() {
        let n = 512;
        let x = test_vector(n);
        let y: Vec<Complex<f32>> = (0..n)
            .map(|i| Complex::new(((i * 7) % 13) as f32 / 13.0 - 0.5, 0.0))
            .collect();
        let (a, b) = (2.0f32, -0.75f32);

        let mut combined: Vec<Complex<f32>> =
            x.iter().zip(&y).map(|(xi, yi)| *xi * a + *yi * b).collect();
        let mut fx = x.clone();
        let mut fy = y.clone();
        fft_in_place(&mut combined);
        fft_in_place(&mut fx);
        fft_in_place(&mut fy);

        for k in 0..n {
            let expected = fx[k] * a + fy[k] * b;
            assert!((combined[k] - expected).norm() < 1e-2);
        }
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let n = 1024;
        let sample_rate = 48000;
        let bin = 37;
        let freq = bin as f32 * sample_rate as f32 / n as f32;
        let samples = (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect();
        let mut analyzer = SpectrumAnalyzer::new(n);
        let frame = analyzer.transform(&SampleBlock::new(samples, sample_rate));
        assert_eq!(frame.len(), n / 2);
        let peak = frame.peak_bin().unwrap();
        assert!(peak.abs_diff(bin) <= 1, "peak at bin {}", peak);
        assert!((frame.frequency_of(bin) - freq).abs() < 1e-3);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        let mut buffer = vec![Complex::new(0.0, 0.0); 1000];
        fft_in_place(&mut buffer);
    }

    #[test]
    fn hann_window_endpoints() {
        let w = hann_window(8);
        assert!(w[0].abs() < 1e-6);
        assert!(w[7].abs() < 1e-6);
        assert!(w.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn history_scrolls() {
        let mut history = SpectrogramHistory::new(2);
        for i in 0..3 {
            history.push(SpectrumFrame {
                bin_hz: i as f32,
                magnitudes_db: vec![],
            });
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.columns().next().unwrap().bin_hz, 1.0);
        assert_eq!(history.latest().unwrap().bin_hz, 2.0);
    }

    #[test]
    fn averager_keeps_trailing_blocks() {
        let mut averager = ResonanceAverager::new(2);
        averager.push(vec![0.0, 100.0, 0.0], 10.0);
        averager.push(vec![0.0, 1.0, 3.0], 10.0);
        averager.push(vec![0.0, 3.0, 0.0], 10.0);
        let summary = averager.summary().unwrap();
        assert_eq!(summary.blocks_averaged, 2);
        assert!((summary.magnitudes_db[1] - 20.0 * 2f32.log10()).abs() < 1e-3);
        assert_eq!(summary.peak_frequency_hz, Some(10.0));
    }

    #[test]
    fn band_energy_sums_selected_bins() {
        let frame = SpectrumFrame {
            bin_hz: 10.0,
            magnitudes_db: vec![0.0, 10.0, 20.0, 0.0],
        };
        assert!((frame.band_energy(10.0, 20.0) - 110.0).abs() < 1e-2);
        assert_eq!(frame.band_energy(50.0, 40.0), 0.0);
    }
}
