//! Configuration for the measurement core, loaded from TOML.
//!
//! Every field has a default so partial files are accepted.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::BUFFER_SIZE;
use crate::error::ConfigError;
use crate::pitch::{
    DEFAULT_MAX_FREQUENCY, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_RMS, DEFAULT_YIN_THRESHOLD,
    DetectorKind, DetectorParams,
};
use crate::session::DisplayMode;
use crate::tuning::{DEFAULT_A4_HZ, NoteSpelling};

/// Smallest block the pitch detectors accept.
const MIN_BLOCK_SIZE: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub analysis: PollConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub kind: DetectorKind,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_yin_threshold")]
    pub yin_threshold: f32,
    #[serde(default = "default_min_rms")]
    pub min_rms: f32,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f32,
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f32,
    /// Readings below this clarity are shown as "no signal".
    #[serde(default = "default_display_clarity")]
    pub display_clarity: f32,
    /// Number of readings averaged for the needle display.
    #[serde(default = "default_smoothing")]
    pub smoothing: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Columns kept for the scrolling spectrogram.
    #[serde(default = "default_history")]
    pub history: usize,
    /// Trailing blocks averaged by a resonance capture.
    #[serde(default = "default_resonance_blocks")]
    pub resonance_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_reference")]
    pub reference_a4_hz: f32,
    #[serde(default)]
    pub transposition_semitones: i32,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub spelling: NoteSpelling,
    /// Stop capturing automatically after this many seconds.
    #[serde(default)]
    pub max_duration_seconds: Option<f64>,
    #[serde(default)]
    pub retain_raw_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::default(),
            block_size: default_block_size(),
            yin_threshold: default_yin_threshold(),
            min_rms: default_min_rms(),
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            display_clarity: default_display_clarity(),
            smoothing: default_smoothing(),
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
            resonance_blocks: default_resonance_blocks(),
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            reference_a4_hz: default_reference(),
            transposition_semitones: 0,
            display_mode: DisplayMode::default(),
            spelling: NoteSpelling::default(),
            max_duration_seconds: None,
            retain_raw_audio: false,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            api_token: None,
        }
    }
}

fn default_block_size() -> usize { BUFFER_SIZE }
fn default_yin_threshold() -> f32 { DEFAULT_YIN_THRESHOLD }
fn default_min_rms() -> f32 { DEFAULT_MIN_RMS }
fn default_min_frequency() -> f32 { DEFAULT_MIN_FREQUENCY }
fn default_max_frequency() -> f32 { DEFAULT_MAX_FREQUENCY }
fn default_display_clarity() -> f32 { 0.9 }
fn default_smoothing() -> usize { 5 }
fn default_history() -> usize { 256 }
fn default_resonance_blocks() -> usize { 8 }
fn default_reference() -> f32 { DEFAULT_A4_HZ }
fn default_poll_interval_ms() -> u64 { 1500 }
fn default_max_attempts() -> u32 { 120 }
fn default_base_url() -> String { "http://localhost:8000".into() }
fn default_request_timeout_secs() -> u64 { 30 }

impl DetectorConfig {
    pub fn params(&self) -> DetectorParams {
        DetectorParams {
            block_size: self.block_size,
            min_frequency: self.min_frequency,
            max_frequency: self.max_frequency,
            threshold: self.yin_threshold,
            min_rms: self.min_rms,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if !d.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSizeNotPowerOfTwo(d.block_size));
        }
        if d.block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid {
                field: "detector.block_size",
                reason: format!("{} is below the minimum of {}", d.block_size, MIN_BLOCK_SIZE),
            });
        }
        if !(d.min_frequency > 0.0 && d.min_frequency < d.max_frequency) {
            return Err(ConfigError::FrequencyRange {
                min: d.min_frequency,
                max: d.max_frequency,
            });
        }
        if !(0.0..=1.0).contains(&d.yin_threshold) {
            return Err(ConfigError::Invalid {
                field: "detector.yin_threshold",
                reason: format!("{} is outside 0..1", d.yin_threshold),
            });
        }
        if !(self.session.reference_a4_hz > 0.0) {
            return Err(ConfigError::ReferencePitch(self.session.reference_a4_hz));
        }
        if self.session.max_duration_seconds.is_some_and(|s| s <= 0.0) {
            return Err(ConfigError::Invalid {
                field: "session.max_duration_seconds",
                reason: "must be positive".into(),
            });
        }
        if self.analysis.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "analysis.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Reads and validates a TOML configuration file.
pub fn load_config(path: &Path) -> Result<CoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: CoreConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
