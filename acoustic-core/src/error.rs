//! # Error Types
//!
//! Typed errors for every fallible seam of the measurement core. Contract
//! violations (wrong block length, non-power-of-two FFT input) are not
//! represented here: they panic at the call site.

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while acquiring or reading a [`crate::audio::SampleSource`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device available")]
    NoDevice,

    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),

    #[error("No suitable f32 input format found")]
    UnsupportedFormat,

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Sample source is closed")]
    SourceClosed,
}

/// Errors raised by the capture-session state machine.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot {action} while session is {from:?}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("Session has no frames to submit")]
    NothingToSubmit,

    #[error("Job belongs to session {job_session}, not {session}")]
    SessionMismatch {
        session: uuid::Uuid,
        job_session: uuid::Uuid,
    },

    #[error("Failed to encode attachment: {0}")]
    Attachment(String),

    #[error("Invalid submission payload: {0}")]
    InvalidPayload(String),

    #[error("Source delivers {delivered}-sample blocks but the processor expects {expected}")]
    BlockSizeMismatch { delivered: usize, expected: usize },

    #[error("Submission failed: {0}")]
    Submission(#[source] BackendError),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// Errors raised by an [`crate::job::AnalysisBackend`] transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend returned HTTP {0}: {1}")]
    Status(u16, String),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

/// Errors raised while validating a [`crate::config::CoreConfig`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Block size {0} is not a power of two")]
    BlockSizeNotPowerOfTwo(usize),

    #[error("Invalid frequency range: {min} Hz .. {max} Hz")]
    FrequencyRange { min: f32, max: f32 },

    #[error("Reference pitch must be positive, got {0} Hz")]
    ReferencePitch(f32),

    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
