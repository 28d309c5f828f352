// acoustic-core/src/lib.rs

//! The measurement core for instrument tuning and acoustic testing.
//! This crate captures audio blocks, estimates pitch and spectra,
//! records measurement sessions and hands them to a remote analysis
//! service. It is completely headless and contains no GUI code.

pub mod audio;
pub mod config;
pub mod error;
pub mod fft;
pub mod http;
pub mod job;
pub mod payload;
pub mod pitch;
pub mod processing;
pub mod session;
pub mod tuning;

pub use audio::{BufferSource, ChannelSource, SampleBlock, SampleSource, channel_source};
#[cfg(feature = "microphone")]
pub use audio::MicrophoneSource;
pub use config::{CoreConfig, load_config};
pub use error::{AudioError, BackendError, ConfigError, SessionError};
pub use http::HttpBackend;
pub use job::{AnalysisBackend, AnalysisJob, AnalysisJobClient, FailureReason, JobStatus, PollPolicy, PollWorker};
pub use payload::SubmissionPayload;
pub use pitch::{DetectorKind, PitchDetector, PitchEstimate, build_detector};
pub use processing::{CentsSmoother, FrameProcessor, TickOutput};
pub use session::{CaptureSession, DisplayMode, MeasurementFrame, SessionConfig, SessionState, TestType};
pub use tuning::{TargetNote, TuningMapper, TuningReading, map_frequency};
