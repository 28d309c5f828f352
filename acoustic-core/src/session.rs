//! # Capture Session Module
//!
//! A capture session records one measurement run (tuner check, intonation
//! recording, resonance sweep...) under a single state machine:
//!
//! ```text
//! Idle -> Armed -> Capturing -> Stopped -> Submitting -> Queued -> Analyzing -> Complete
//!                                              |            |          |
//!                                              +------------+----------+--> Failed
//! ```
//!
//! The session owns its [`SampleSource`] from `arm` until it is dropped or the
//! source is taken back, so a source can never feed two capturing sessions.
//! The source is closed on every path out of `Armed`/`Capturing`.
//!
//! Frames are appended only from [`CaptureSession::process_next_block`], the
//! audio tick. Submission and polling happen on a separate cadence through
//! [`crate::job::AnalysisJobClient`], which drives the remaining transitions.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use linreg::linear_regression;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::{SampleBlock, SampleSource};
use crate::config::CoreConfig;
use crate::error::SessionError;
use crate::fft::{ResonanceAverager, SpectrogramHistory, SpectrumSummary};
use crate::job::{AnalysisJob, FailureReason, JobStatus};
use crate::payload::{Attachment, SessionConfigPayload, SubmissionPayload, TestPayload};
use crate::processing::{FrameProcessor, TickOutput};
use crate::tuning::{NoteSpelling, TuningMapper};

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Armed,
    Capturing,
    Stopped,
    Submitting,
    Queued,
    Analyzing,
    Complete,
    Failed,
}

/// Which measurement tool produced the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Tuner,
    Intonation,
    Resonance,
    Impedance,
    Lab,
}

impl TestType {
    /// Tests that report an averaged spectrum of the trailing blocks.
    pub fn averages_spectrum(self) -> bool {
        matches!(self, TestType::Resonance | TestType::Impedance)
    }
}

/// How the live reading is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Needle,
    Strobe,
    Note,
}

/// Configuration snapshot taken when the session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub reference_a4_hz: f32,
    pub transposition_semitones: i32,
    pub instrument_type: String,
    pub display_mode: DisplayMode,
    pub spelling: NoteSpelling,
    pub max_duration_seconds: Option<f64>,
    pub retain_raw_audio: bool,
    pub resonance_blocks: usize,
    pub spectrogram_history: usize,
}

impl SessionConfig {
    pub fn from_core(config: &CoreConfig, instrument_type: impl Into<String>) -> Self {
        Self {
            reference_a4_hz: config.session.reference_a4_hz,
            transposition_semitones: config.session.transposition_semitones,
            instrument_type: instrument_type.into(),
            display_mode: config.session.display_mode,
            spelling: config.session.spelling,
            max_duration_seconds: config.session.max_duration_seconds,
            retain_raw_audio: config.session.retain_raw_audio,
            resonance_blocks: config.spectrum.resonance_blocks,
            spectrogram_history: config.spectrum.history,
        }
    }

    pub fn mapper(&self) -> TuningMapper {
        TuningMapper::new(self.reference_a4_hz)
            .with_transposition(self.transposition_semitones)
            .with_spelling(self.spelling)
    }
}

/// One row of the recorded time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementFrame {
    pub t_relative_seconds: f64,
    pub frequency_hz: Option<f32>,
    pub clarity: f32,
    /// 0.0 when no pitch was detected.
    pub cents: f32,
    pub level_rms: f32,
}

/// Statistics computed when a session is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub frame_count: usize,
    pub voiced_frames: usize,
    pub voiced_ratio: f32,
    pub mean_frequency_hz: Option<f32>,
    pub mean_cents: Option<f32>,
    pub cents_std_dev: Option<f32>,
    /// Slope of a least-squares fit of cents over time.
    pub cents_drift_per_second: Option<f32>,
    pub peak_rms: f32,
}

impl SessionSummary {
    pub fn from_frames(frames: &[MeasurementFrame]) -> Self {
        let voiced: Vec<&MeasurementFrame> =
            frames.iter().filter(|f| f.frequency_hz.is_some()).collect();
        let peak_rms = frames.iter().map(|f| f.level_rms).fold(0.0, f32::max);

        let voiced_ratio = if frames.is_empty() {
            0.0
        } else {
            voiced.len() as f32 / frames.len() as f32
        };

        let (mean_frequency_hz, mean_cents, cents_std_dev) = if voiced.is_empty() {
            (None, None, None)
        } else {
            let n = voiced.len() as f64;
            let mean_f = voiced
                .iter()
                .filter_map(|f| f.frequency_hz)
                .map(|hz| hz as f64)
                .sum::<f64>()
                / n;
            let mean_c = voiced.iter().map(|f| f.cents as f64).sum::<f64>() / n;
            let var = voiced
                .iter()
                .map(|f| (f.cents as f64 - mean_c).powi(2))
                .sum::<f64>()
                / n;
            (
                Some(mean_f as f32),
                Some(mean_c as f32),
                Some(var.sqrt() as f32),
            )
        };

        let cents_drift_per_second = if voiced.len() >= 2 {
            let (xs, ys): (Vec<f64>, Vec<f64>) = voiced
                .iter()
                .map(|f| (f.t_relative_seconds, f.cents as f64))
                .unzip();
            linear_regression::<_, _, f64>(&xs, &ys)
                .ok()
                .map(|(slope, _intercept)| slope as f32)
                .filter(|s| s.is_finite())
        } else {
            None
        };

        Self {
            frame_count: frames.len(),
            voiced_frames: voiced.len(),
            voiced_ratio,
            mean_frequency_hz,
            mean_cents,
            cents_std_dev,
            cents_drift_per_second,
            peak_rms,
        }
    }
}

/// A single capture run and its recorded measurements.
pub struct CaptureSession<S: SampleSource> {
    id: Uuid,
    test_type: TestType,
    config: SessionConfig,
    state: SessionState,
    source: Option<S>,
    processor: FrameProcessor,
    sample_rate: u32,
    blocks_processed: u64,
    samples_processed: u64,
    frames: Vec<MeasurementFrame>,
    raw_audio: Vec<f32>,
    images: Vec<Attachment>,
    spectrogram: SpectrogramHistory,
    resonance: Option<ResonanceAverager>,
    spectrum_summary: Option<SpectrumSummary>,
    summary: Option<SessionSummary>,
    remote_id: Option<String>,
    artifacts: Vec<String>,
    failure: Option<FailureReason>,
}

impl<S: SampleSource> CaptureSession<S> {
    pub fn new(test_type: TestType, config: SessionConfig, processor: FrameProcessor) -> Self {
        let resonance = test_type
            .averages_spectrum()
            .then(|| ResonanceAverager::new(config.resonance_blocks));
        let spectrogram = SpectrogramHistory::new(config.spectrogram_history);
        Self {
            id: Uuid::new_v4(),
            test_type,
            config,
            state: SessionState::Idle,
            source: None,
            processor,
            sample_rate: 0,
            blocks_processed: 0,
            samples_processed: 0,
            frames: Vec::new(),
            raw_audio: Vec::new(),
            images: Vec::new(),
            spectrogram,
            resonance,
            spectrum_summary: None,
            summary: None,
            remote_id: None,
            artifacts: Vec::new(),
            failure: None,
        }
    }

    /// Creates a session whose processor follows `core` and the session's tuning setup.
    pub fn from_config(test_type: TestType, core: &CoreConfig, config: SessionConfig) -> Self {
        let processor = FrameProcessor::from_config(core, config.mapper());
        Self::new(test_type, config, processor)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn test_type(&self) -> TestType {
        self.test_type
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn frames(&self) -> &[MeasurementFrame] {
        &self.frames
    }

    pub fn processor_mut(&mut self) -> &mut FrameProcessor {
        &mut self.processor
    }

    pub fn spectrogram(&self) -> &SpectrogramHistory {
        &self.spectrogram
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn spectrum_summary(&self) -> Option<&SpectrumSummary> {
        self.spectrum_summary.as_ref()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Result artifacts, populated once the session is `Complete`.
    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    /// Reason of the last failure while the session is `Failed`.
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Seconds of audio captured so far.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples_processed as f64 / self.sample_rate as f64
    }

    pub fn source_is_open(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_open())
    }

    /// Returns the (closed) source once the session no longer needs it.
    pub fn take_source(&mut self) -> Option<S> {
        if matches!(self.state, SessionState::Armed | SessionState::Capturing) {
            return None;
        }
        self.source.take()
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    fn transition(&mut self, to: SessionState) {
        info!("Session {}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
    }

    fn release_source(&mut self) {
        if let Some(source) = self.source.as_mut() {
            if source.is_open() {
                source.close();
                debug!("Session {}: sample source released", self.id);
            }
        }
    }

    /// Acquires `source` and moves to `Armed`.
    ///
    /// On failure the session stays `Idle` and the error is returned; nothing
    /// is retried.
    pub fn arm(&mut self, mut source: S) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(self.invalid("arm"));
        }
        if source.block_size() != self.processor.block_size() {
            warn!(
                "Session {}: source delivers {}-sample blocks, processor expects {}",
                self.id,
                source.block_size(),
                self.processor.block_size()
            );
            source.close();
            return Err(SessionError::BlockSizeMismatch {
                delivered: source.block_size(),
                expected: self.processor.block_size(),
            });
        }
        if let Err(e) = source.open() {
            warn!("Session {}: failed to acquire sample source: {}", self.id, e);
            source.close();
            return Err(e.into());
        }
        self.sample_rate = source.sample_rate();
        self.source = Some(source);
        self.transition(SessionState::Armed);
        Ok(())
    }

    /// Begins capturing. A no-op unless the session is `Armed`.
    pub fn start(&mut self) -> bool {
        if self.state != SessionState::Armed {
            debug!("Session {}: start ignored in {:?}", self.id, self.state);
            return false;
        }
        self.transition(SessionState::Capturing);
        true
    }

    /// Audio tick: pulls one block from the source, analyzes it and records
    /// a frame. Returns `Ok(None)` when not capturing or no block is ready.
    ///
    /// A source error ends the capture (frames so far are kept) and is
    /// returned to the caller.
    pub fn process_next_block(&mut self) -> Result<Option<TickOutput>, SessionError> {
        if self.state != SessionState::Capturing {
            return Ok(None);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let block = match source.next_block() {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Session {}: sample source failed: {}", self.id, e);
                self.stop();
                return Err(e.into());
            }
        };
        Ok(Some(self.record_block(block)))
    }

    fn record_block(&mut self, block: SampleBlock) -> TickOutput {
        if self.sample_rate != block.sample_rate() {
            self.sample_rate = block.sample_rate();
        }
        let output = self.processor.process(&block);

        let frame = MeasurementFrame {
            t_relative_seconds: self.duration_seconds(),
            frequency_hz: output.frequency_hz,
            clarity: output.estimate.clarity,
            cents: output.cents,
            level_rms: output.level_rms,
        };
        self.frames.push(frame);
        self.blocks_processed += 1;
        self.samples_processed += block.len() as u64;

        if self.config.retain_raw_audio {
            self.raw_audio.extend_from_slice(block.samples());
        }
        if let Some(averager) = self.resonance.as_mut() {
            averager.push_frame(&output.spectrum);
        }
        self.spectrogram.push(output.spectrum.clone());

        if let Some(limit) = self.config.max_duration_seconds {
            if self.duration_seconds() >= limit {
                info!("Session {}: capture duration limit reached", self.id);
                self.stop();
            }
        }
        output
    }

    /// Ends capture and seals the session. A no-op unless `Capturing`.
    pub fn stop(&mut self) -> bool {
        if self.state != SessionState::Capturing {
            debug!("Session {}: stop ignored in {:?}", self.id, self.state);
            return false;
        }
        self.release_source();
        self.seal();
        self.transition(SessionState::Stopped);
        true
    }

    fn seal(&mut self) {
        self.summary = Some(SessionSummary::from_frames(&self.frames));
        self.spectrum_summary = self.resonance.as_ref().and_then(|r| r.summary());
        info!(
            "Session {}: sealed {} frames ({:.2}s)",
            self.id,
            self.frames.len(),
            self.duration_seconds()
        );
    }

    /// Discards everything recorded and returns to `Idle` with a fresh id.
    ///
    /// The source is closed but kept, so it can be taken back or re-armed.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Submitting {
            return Err(self.invalid("reset"));
        }
        self.release_source();
        self.processor.clear_smoothing();
        self.frames.clear();
        self.raw_audio.clear();
        self.images.clear();
        self.spectrogram.clear();
        if let Some(averager) = self.resonance.as_mut() {
            averager.clear();
        }
        self.spectrum_summary = None;
        self.summary = None;
        self.remote_id = None;
        self.artifacts.clear();
        self.failure = None;
        self.blocks_processed = 0;
        self.samples_processed = 0;
        self.id = Uuid::new_v4();
        self.transition(SessionState::Idle);
        Ok(())
    }

    /// Re-arms a reset session with the source it already holds.
    pub fn rearm(&mut self) -> Result<(), SessionError> {
        match self.source.take() {
            Some(source) if self.state == SessionState::Idle => self.arm(source),
            other => {
                self.source = other;
                Err(self.invalid("rearm"))
            }
        }
    }

    /// Attaches a snapshot image (plot, screenshot) sent along with the frames.
    pub fn attach_image(
        &mut self,
        filename: impl Into<String>,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        if matches!(
            self.state,
            SessionState::Submitting | SessionState::Queued | SessionState::Analyzing
        ) {
            return Err(self.invalid("attach an image"));
        }
        self.images.push(Attachment {
            filename: filename.into(),
            data_uri: data_uri(mime_type, bytes),
        });
        Ok(())
    }

    pub fn images(&self) -> &[Attachment] {
        &self.images
    }

    /// Retained raw audio as a 32-bit float mono WAV file.
    pub fn raw_audio_wav(&self) -> Result<Option<Vec<u8>>, SessionError> {
        if !self.config.retain_raw_audio || self.raw_audio.is_empty() {
            return Ok(None);
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| SessionError::Attachment(e.to_string()))?;
            for &sample in &self.raw_audio {
                writer
                    .write_sample(sample)
                    .map_err(|e| SessionError::Attachment(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| SessionError::Attachment(e.to_string()))?;
        }
        Ok(Some(cursor.into_inner()))
    }

    /// Packages the sealed session for the backend.
    pub fn submission_payload(&self) -> Result<SubmissionPayload, SessionError> {
        if self.frames.is_empty() {
            return Err(SessionError::NothingToSubmit);
        }
        let raw_audio = self.raw_audio_wav()?.map(|wav| Attachment {
            filename: format!("{}.wav", self.id),
            data_uri: data_uri("audio/wav", &wav),
        });

        let payload = SubmissionPayload {
            session_id: Some(self.id),
            session_config: SessionConfigPayload {
                reference_a4_hz: self.config.reference_a4_hz,
                instrument_type: self.config.instrument_type.clone(),
                display_mode: self.config.display_mode,
                transposition_semitones: self.config.transposition_semitones,
            },
            test_payload: TestPayload {
                test_type: self.test_type,
                duration_seconds: self.duration_seconds(),
                frames: self.frames.clone(),
                raw_spectrum_summary: self.spectrum_summary.clone(),
                summary: self.summary.clone(),
            },
            images: self.images.clone(),
            raw_audio,
        };
        payload.validate().map_err(SessionError::InvalidPayload)?;
        Ok(payload)
    }

    /// `Stopped`/`Failed` -> `Submitting`; returns the payload to send.
    ///
    /// Resubmitting from `Failed` reuses the recorded frames.
    pub fn begin_submission(&mut self) -> Result<SubmissionPayload, SessionError> {
        if !matches!(self.state, SessionState::Stopped | SessionState::Failed) {
            return Err(self.invalid("submit"));
        }
        let payload = self.submission_payload()?;
        self.failure = None;
        self.transition(SessionState::Submitting);
        Ok(payload)
    }

    /// `Submitting` -> `Queued` once the backend accepted the job.
    pub fn mark_submitted(&mut self, remote_id: impl Into<String>) -> Result<(), SessionError> {
        if self.state != SessionState::Submitting {
            return Err(self.invalid("mark submitted"));
        }
        self.remote_id = Some(remote_id.into());
        self.transition(SessionState::Queued);
        Ok(())
    }

    /// Moves to `Failed`, keeping the recorded frames.
    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            SessionState::Submitting | SessionState::Queued | SessionState::Analyzing
        ) {
            return Err(self.invalid("fail"));
        }
        warn!("Session {}: failed: {}", self.id, reason);
        self.failure = Some(reason);
        self.transition(SessionState::Failed);
        Ok(())
    }

    /// Applies a polled job status to the session.
    ///
    /// Ignored once the session has left the Queued/Analyzing phase.
    pub fn reconcile(&mut self, job: &AnalysisJob) -> Result<(), SessionError> {
        if job.session_id != self.id {
            return Err(SessionError::SessionMismatch {
                session: self.id,
                job_session: job.session_id,
            });
        }
        if !matches!(self.state, SessionState::Queued | SessionState::Analyzing) {
            debug!("Session {}: reconcile ignored in {:?}", self.id, self.state);
            return Ok(());
        }
        match job.status {
            JobStatus::Queued => {}
            JobStatus::Running => {
                if self.state != SessionState::Analyzing {
                    self.transition(SessionState::Analyzing);
                }
            }
            JobStatus::Complete => {
                self.artifacts = job.artifacts.clone();
                self.transition(SessionState::Complete);
            }
            JobStatus::Failed => {
                let reason = job
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureReason::Backend("analysis failed".into()));
                self.mark_failed(reason)?;
            }
        }
        Ok(())
    }
}

impl<S: SampleSource> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        self.release_source();
    }
}

fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferSource;
    use crate::error::AudioError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SAMPLE_RATE: u32 = 44100;
    const BLOCK: usize = 2048;

    /// Source that reports its open flag through a shared handle.
    struct FlagSource {
        inner: BufferSource,
        open: Arc<AtomicBool>,
        deny: bool,
    }

    impl FlagSource {
        fn tone(freq: f32, blocks: usize) -> (Self, Arc<AtomicBool>) {
            let samples = (0..BLOCK * blocks)
                .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
                .collect();
            let open = Arc::new(AtomicBool::new(false));
            (
                Self {
                    inner: BufferSource::new(samples, SAMPLE_RATE, BLOCK),
                    open: open.clone(),
                    deny: false,
                },
                open,
            )
        }
    }

    impl SampleSource for FlagSource {
        fn open(&mut self) -> Result<(), AudioError> {
            if self.deny {
                return Err(AudioError::PermissionDenied);
            }
            self.open.store(true, Ordering::SeqCst);
            self.inner.open()
        }

        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
            self.inner.close();
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }

        fn block_size(&self) -> usize {
            BLOCK
        }

        fn next_block(&mut self) -> Result<Option<SampleBlock>, AudioError> {
            self.inner.next_block()
        }
    }

    impl FlagSource {
        fn from_samples(samples: Vec<f32>, block: usize) -> (Self, Arc<AtomicBool>) {
            let open = Arc::new(AtomicBool::new(false));
            (
                Self {
                    inner: BufferSource::new(samples, SAMPLE_RATE, block),
                    open: open.clone(),
                    deny: false,
                },
                open,
            )
        }
    }

    fn session(test_type: TestType) -> CaptureSession<FlagSource> {
        let core = CoreConfig::default();
        CaptureSession::from_config(test_type, &core, SessionConfig::from_core(&core, "clarinet"))
    }

    fn capture(session: &mut CaptureSession<FlagSource>, blocks: usize) {
        for _ in 0..blocks {
            session.process_next_block().unwrap();
        }
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let mut s = session(TestType::Tuner);
        assert!(!s.stop());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn start_when_capturing_is_noop() {
        let mut s = session(TestType::Tuner);
        let (source, _) = FlagSource::tone(440.0, 4);
        s.arm(source).unwrap();
        assert!(s.start());
        assert!(!s.start());
        assert_eq!(s.state(), SessionState::Capturing);
    }

    #[test]
    fn start_when_idle_is_noop() {
        let mut s = session(TestType::Tuner);
        assert!(!s.start());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn stop_releases_source() {
        let mut s = session(TestType::Intonation);
        let (source, open) = FlagSource::tone(440.0, 4);
        s.arm(source).unwrap();
        assert!(open.load(Ordering::SeqCst));
        s.start();
        capture(&mut s, 2);
        assert!(s.stop());
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(!open.load(Ordering::SeqCst));
        assert!(!s.source_is_open());
        assert_eq!(s.frames().len(), 2);
    }

    #[test]
    fn permission_denied_keeps_idle() {
        let mut s = session(TestType::Tuner);
        let (mut source, open) = FlagSource::tone(440.0, 1);
        source.deny = true;
        let err = s.arm(source).unwrap_err();
        assert!(matches!(err, SessionError::Audio(AudioError::PermissionDenied)));
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[test]
    fn frames_are_time_ordered_and_pitched() {
        let mut s = session(TestType::Intonation);
        let (source, _) = FlagSource::tone(440.0, 3);
        s.arm(source).unwrap();
        s.start();
        capture(&mut s, 3);
        let frames = s.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].t_relative_seconds, 0.0);
        assert!(frames.windows(2).all(|w| w[0].t_relative_seconds < w[1].t_relative_seconds));
        for frame in frames {
            let hz = frame.frequency_hz.unwrap();
            assert!((hz - 440.0).abs() < 2.2);
        }
    }

    #[test]
    fn duration_limit_stops_capture() {
        let core = CoreConfig::default();
        let mut config = SessionConfig::from_core(&core, "oboe");
        config.max_duration_seconds = Some(0.09);
        let mut s: CaptureSession<FlagSource> =
            CaptureSession::from_config(TestType::Tuner, &core, config);
        let (source, open) = FlagSource::tone(440.0, 10);
        s.arm(source).unwrap();
        s.start();
        capture(&mut s, 10);
        // 2048 samples at 44.1 kHz is ~46 ms, so the second block crosses 90 ms.
        assert_eq!(s.frames().len(), 2);
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[test]
    fn process_is_noop_when_not_capturing() {
        let mut s = session(TestType::Tuner);
        let (source, _) = FlagSource::tone(440.0, 2);
        s.arm(source).unwrap();
        assert!(s.process_next_block().unwrap().is_none());
        assert!(s.frames().is_empty());
    }

    #[test]
    fn drop_releases_source() {
        let (source, open) = FlagSource::tone(440.0, 2);
        {
            let mut s = session(TestType::Tuner);
            s.arm(source).unwrap();
            s.start();
            assert!(open.load(Ordering::SeqCst));
        }
        assert!(!open.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_from_armed_releases_and_rearms() {
        let mut s = session(TestType::Tuner);
        let (source, open) = FlagSource::tone(440.0, 2);
        s.arm(source).unwrap();
        let first_id = s.id();
        s.reset().unwrap();
        assert!(!open.load(Ordering::SeqCst));
        assert_ne!(s.id(), first_id);
        s.rearm().unwrap();
        assert_eq!(s.state(), SessionState::Armed);
        assert!(open.load(Ordering::SeqCst));
    }

    #[test]
    fn submission_requires_sealed_session() {
        let mut s = session(TestType::Tuner);
        assert!(matches!(
            s.begin_submission(),
            Err(SessionError::InvalidTransition { from: SessionState::Idle, .. })
        ));

        let (source, _) = FlagSource::tone(440.0, 2);
        s.arm(source).unwrap();
        s.start();
        s.stop();
        assert!(matches!(s.begin_submission(), Err(SessionError::NothingToSubmit)));
    }

    #[test]
    fn payload_carries_summary_images_and_audio() {
        let core = CoreConfig::default();
        let mut config = SessionConfig::from_core(&core, "flute");
        config.retain_raw_audio = true;
        let mut s: CaptureSession<FlagSource> =
            CaptureSession::from_config(TestType::Resonance, &core, config);
        let (source, _) = FlagSource::tone(440.0, 3);
        s.arm(source).unwrap();
        s.start();
        capture(&mut s, 3);
        s.stop();
        s.attach_image("plot.png", "image/png", &[0x89, 0x50, 0x4e, 0x47]).unwrap();

        let payload = s.begin_submission().unwrap();
        assert_eq!(s.state(), SessionState::Submitting);
        assert_eq!(payload.session_id, Some(s.id()));
        assert_eq!(payload.test_payload.frames.len(), 3);
        assert_eq!(payload.images[0].data_uri, "data:image/png;base64,iVBORw==");

        let summary = payload.test_payload.summary.unwrap();
        assert_eq!(summary.voiced_frames, 3);
        assert!((summary.mean_frequency_hz.unwrap() - 440.0).abs() < 2.2);

        let spectrum = payload.test_payload.raw_spectrum_summary.unwrap();
        assert_eq!(spectrum.blocks_averaged, 3);
        assert!((spectrum.peak_frequency_hz.unwrap() - 440.0).abs() < 2.0 * spectrum.bin_hz);

        let audio = payload.raw_audio.unwrap();
        assert!(audio.data_uri.starts_with("data:audio/wav;base64,"));
    }

    #[test]
    fn noise_frames_carry_no_pitch() {
        let mut core = CoreConfig::default();
        core.detector.kind = crate::pitch::DetectorKind::Autocorrelation;
        let config = SessionConfig::from_core(&core, "cello");
        let mut s: CaptureSession<FlagSource> =
            CaptureSession::from_config(TestType::Lab, &core, config);

        let mut state = 0x1234_5678_u32;
        let noise = (0..BLOCK * 4)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 0.6 - 0.3
            })
            .collect();
        let (source, _) = FlagSource::from_samples(noise, BLOCK);
        s.arm(source).unwrap();
        s.start();
        capture(&mut s, 4);
        s.stop();

        assert_eq!(s.frames().len(), 4);
        for frame in s.frames() {
            assert!(frame.frequency_hz.is_none(), "{:?}", frame);
            assert_eq!(frame.cents, 0.0);
            assert!(frame.level_rms > 0.1);
        }
        assert_eq!(s.summary().unwrap().voiced_frames, 0);
    }

    #[test]
    fn mismatched_block_size_is_rejected() {
        let mut s = session(TestType::Tuner);
        let (source, open) = FlagSource::from_samples(vec![0.0; 4096], 1024);
        let err = s.arm(source).unwrap_err();
        assert!(matches!(
            err,
            SessionError::BlockSizeMismatch { delivered: 1024, expected: 2048 }
        ));
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_frames_are_reported_as_payload_errors() {
        let mut s = session(TestType::Tuner);
        let mut samples = vec![0.1; BLOCK];
        samples[10] = f32::NAN;
        let (source, _) = FlagSource::from_samples(samples, BLOCK);
        s.arm(source).unwrap();
        s.start();
        capture(&mut s, 1);
        s.stop();

        let err = s.begin_submission().unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));
        assert_eq!(
            err.to_string(),
            "Invalid submission payload: frame contains a non-finite value"
        );
        assert_eq!(s.state(), SessionState::Stopped);
    }

    #[test]
    fn summary_fits_drift() {
        let frames: Vec<MeasurementFrame> = (0..5)
            .map(|i| MeasurementFrame {
                t_relative_seconds: i as f64 * 0.5,
                frequency_hz: Some(440.0),
                clarity: 0.95,
                cents: 2.0 * i as f32 * 0.5 - 1.0,
                level_rms: 0.1 * i as f32,
            })
            .collect();
        let summary = SessionSummary::from_frames(&frames);
        assert_eq!(summary.frame_count, 5);
        assert!((summary.cents_drift_per_second.unwrap() - 2.0).abs() < 1e-4);
        assert!((summary.peak_rms - 0.4).abs() < 1e-6);
        assert_eq!(summary.voiced_ratio, 1.0);
    }

    #[test]
    fn summary_of_silence() {
        let frames = vec![MeasurementFrame {
            t_relative_seconds: 0.0,
            frequency_hz: None,
            clarity: 0.0,
            cents: 0.0,
            level_rms: 0.0,
        }];
        let summary = SessionSummary::from_frames(&frames);
        assert_eq!(summary.voiced_frames, 0);
        assert!(summary.mean_cents.is_none());
        assert!(summary.cents_drift_per_second.is_none());
    }
}
