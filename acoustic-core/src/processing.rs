//! # Frame Processing Module
//!
//! The per-block analysis pipeline run on the audio tick:
//! 1. Level (RMS) of the block
//! 2. Pitch estimate from the active detector
//! 3. Spectrum frame for the spectrogram
//! 4. Tuning reading for display, gated on clarity
//!
//! Low energy or low clarity is not an error: the display simply gets no
//! reading and the recorded frame has no frequency. The raw estimate, clarity
//! included, is still reported.

use std::collections::VecDeque;

use log::trace;

use crate::audio::SampleBlock;
use crate::config::CoreConfig;
use crate::fft::{SpectrumAnalyzer, SpectrumFrame};
use crate::pitch::{PitchDetector, PitchEstimate, build_detector};
use crate::tuning::{TargetNote, TuningMapper, TuningReading};

/// Everything produced for one block.
#[derive(Debug, Clone)]
pub struct TickOutput {
    /// Detector output before the clarity gate.
    pub estimate: PitchEstimate,
    /// Detected frequency, `None` when the clarity is below the gate.
    pub frequency_hz: Option<f32>,
    pub level_rms: f32,
    /// Cents against the nearest note (or the target note when one is set);
    /// 0.0 when no pitch passed the gate.
    pub cents: f32,
    /// Moving average of `cents` for the needle, reset by unvoiced blocks.
    pub smoothed_cents: Option<f32>,
    /// Reading for the needle/note display, `None` means "no signal".
    pub reading: Option<TuningReading>,
    pub spectrum: SpectrumFrame,
}

/// Runs detector, spectrum analyzer and tuning mapper over each block.
pub struct FrameProcessor {
    detector: Box<dyn PitchDetector>,
    analyzer: SpectrumAnalyzer,
    mapper: TuningMapper,
    display_clarity: f32,
    target: Option<TargetNote>,
    smoother: CentsSmoother,
}

impl FrameProcessor {
    /// # Panics
    /// If the detector and analyzer disagree on the block length.
    pub fn new(
        detector: Box<dyn PitchDetector>,
        analyzer: SpectrumAnalyzer,
        mapper: TuningMapper,
        display_clarity: f32,
    ) -> Self {
        assert_eq!(
            detector.block_size(),
            analyzer.size(),
            "detector and spectrum analyzer block sizes differ"
        );
        Self {
            detector,
            analyzer,
            mapper,
            display_clarity,
            target: None,
            smoother: CentsSmoother::new(1),
        }
    }

    /// Averages the needle over the last `window` voiced readings.
    pub fn with_smoothing(mut self, window: usize) -> Self {
        self.smoother = CentsSmoother::new(window);
        self
    }

    pub fn clear_smoothing(&mut self) {
        self.smoother.clear();
    }

    /// Builds a processor from configuration and the session's tuning setup.
    pub fn from_config(config: &CoreConfig, mapper: TuningMapper) -> Self {
        let detector = build_detector(config.detector.kind, config.detector.params());
        Self::new(
            detector,
            SpectrumAnalyzer::new(config.detector.block_size),
            mapper,
            config.detector.display_clarity,
        )
        .with_smoothing(config.detector.smoothing)
    }

    pub fn block_size(&self) -> usize {
        self.analyzer.size()
    }

    pub fn mapper(&self) -> &TuningMapper {
        &self.mapper
    }

    /// Swaps the detection strategy, keeping everything else.
    pub fn set_detector(&mut self, detector: Box<dyn PitchDetector>) {
        assert_eq!(
            detector.block_size(),
            self.analyzer.size(),
            "detector and spectrum analyzer block sizes differ"
        );
        self.detector = detector;
    }

    /// Measures cents against `target` instead of the nearest note.
    pub fn set_target(&mut self, target: Option<TargetNote>) {
        self.target = target;
    }

    pub fn process(&mut self, block: &SampleBlock) -> TickOutput {
        let level_rms = block.rms();
        let estimate = self.detector.detect(block);
        let spectrum = self.analyzer.transform(block);

        let frequency_hz = estimate
            .frequency_hz
            .filter(|_| estimate.clarity >= self.display_clarity);
        let reading = frequency_hz.map(|freq| {
            let mut reading = self.mapper.map(freq);
            if let Some(target) = self.target {
                reading.cents = self.mapper.cents_from_target(freq, target);
            }
            reading
        });
        let cents = reading.as_ref().map_or(0.0, |r| r.cents);
        let smoothed_cents = self.smoother.push(reading.as_ref().map(|r| r.cents));

        trace!(
            "tick: rms={:.4} freq={:?} clarity={:.3} cents={:.1}",
            level_rms, estimate.frequency_hz, estimate.clarity, cents
        );

        TickOutput {
            estimate,
            frequency_hz,
            level_rms,
            cents,
            smoothed_cents,
            reading,
            spectrum,
        }
    }
}

/// Moving average of recent cents readings for a steadier needle.
#[derive(Debug, Clone)]
pub struct CentsSmoother {
    window: usize,
    values: VecDeque<f32>,
}

impl CentsSmoother {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Adds a reading and returns the smoothed value.
    /// A missing reading clears the history.
    pub fn push(&mut self, cents: Option<f32>) -> Option<f32> {
        let Some(cents) = cents else {
            self.values.clear();
            return None;
        };
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(cents);
        Some(self.values.iter().sum::<f32>() / self.values.len() as f32)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pitch::{DetectorKind, DetectorParams};

    fn sine(freq: f32, amplitude: f32, n: usize, sample_rate: u32) -> SampleBlock {
        let samples = (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect();
        SampleBlock::new(samples, sample_rate)
    }

    #[test]
    fn processes_a_tone() {
        let mut processor = FrameProcessor::from_config(&CoreConfig::default(), TuningMapper::default());
        let output = processor.process(&sine(440.0, 0.5, 2048, 44100));
        let reading = output.reading.expect("tone should produce a reading");
        assert_eq!(reading.label(), "A4");
        assert!(output.cents.abs() < 10.0);
        assert!((output.level_rms - 0.5 / 2f32.sqrt()).abs() < 0.01);
        assert_eq!(output.spectrum.len(), 1024);
    }

    #[test]
    fn silence_has_no_reading() {
        let mut processor = FrameProcessor::from_config(&CoreConfig::default(), TuningMapper::default());
        let output = processor.process(&SampleBlock::new(vec![0.0; 2048], 44100));
        assert!(output.reading.is_none());
        assert!(!output.estimate.is_voiced());
        assert_eq!(output.cents, 0.0);
    }

    #[test]
    fn target_note_overrides_nearest() {
        let mut processor = FrameProcessor::from_config(&CoreConfig::default(), TuningMapper::default());
        processor.set_target(TargetNote::parse("G4"));
        let output = processor.process(&sine(440.0, 0.5, 2048, 44100));
        assert!((output.cents - 200.0).abs() < 10.0);
    }

    #[test]
    fn detector_can_be_swapped() {
        let mut processor = FrameProcessor::from_config(&CoreConfig::default(), TuningMapper::default());
        processor.set_detector(build_detector(
            DetectorKind::Autocorrelation,
            DetectorParams::new(2048),
        ));
        let output = processor.process(&sine(440.0, 0.5, 2048, 44100));
        assert!(output.reading.is_some());
    }

    #[test]
    fn low_clarity_estimate_is_not_recorded_as_pitch() {
        let mut processor = FrameProcessor::from_config(&CoreConfig::default(), TuningMapper::default());
        // A tone pushed past the gate: the raw estimate is kept, the pitch is not.
        processor.display_clarity = 1.01;
        let output = processor.process(&sine(440.0, 0.5, 2048, 44100));
        assert!(output.estimate.is_voiced());
        assert!(output.estimate.clarity > 0.9);
        assert!(output.frequency_hz.is_none());
        assert!(output.reading.is_none());
        assert_eq!(output.cents, 0.0);
        assert!(output.smoothed_cents.is_none());
    }

    #[test]
    fn config_smoothing_averages_needle() {
        let mut config = CoreConfig::default();
        config.detector.smoothing = 2;
        let mut processor = FrameProcessor::from_config(&config, TuningMapper::default());
        let a4 = processor.process(&sine(440.0, 0.5, 2048, 44100));
        let sharp = processor.process(&sine(445.0, 0.5, 2048, 44100));
        let expected = (a4.cents + sharp.cents) / 2.0;
        assert!((sharp.smoothed_cents.unwrap() - expected).abs() < 1e-4);

        processor.process(&SampleBlock::new(vec![0.0; 2048], 44100));
        let again = processor.process(&sine(445.0, 0.5, 2048, 44100));
        assert!((again.smoothed_cents.unwrap() - again.cents).abs() < 1e-4);
    }

    #[test]
    fn smoother_averages_and_resets() {
        let mut smoother = CentsSmoother::new(2);
        assert_eq!(smoother.push(Some(10.0)), Some(10.0));
        assert_eq!(smoother.push(Some(20.0)), Some(15.0));
        assert_eq!(smoother.push(Some(40.0)), Some(30.0));
        assert_eq!(smoother.push(None), None);
        assert_eq!(smoother.push(Some(4.0)), Some(4.0));
    }
}
