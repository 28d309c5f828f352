//! Wire types exchanged with the analysis backend.
//!
//! Submission payloads are built from a sealed session and checked with
//! [`SubmissionPayload::validate`] before leaving the process. Poll responses
//! are rejected at deserialization if the status is unknown.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fft::SpectrumSummary;
use crate::session::{DisplayMode, MeasurementFrame, SessionSummary, TestType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub session_config: SessionConfigPayload,
    pub test_payload: TestPayload,
    #[serde(default)]
    pub images: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_audio: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigPayload {
    #[serde(rename = "referenceA4Hz")]
    pub reference_a4_hz: f32,
    pub instrument_type: String,
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub transposition_semitones: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPayload {
    pub test_type: TestType,
    pub duration_seconds: f64,
    pub frames: Vec<MeasurementFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_spectrum_summary: Option<SpectrumSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

/// A file sent inline as a data URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub data_uri: String,
}

/// Job status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    #[serde(alias = "queued")]
    Queued,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "complete")]
    Complete,
    #[serde(alias = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub status: RemoteStatus,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Backend-provided reason for a failed job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
}

impl SubmissionPayload {
    /// Checks the invariants the backend relies on.
    pub fn validate(&self) -> Result<(), String> {
        let frames = &self.test_payload.frames;
        if frames.is_empty() {
            return Err("payload has no frames".into());
        }
        if frames
            .windows(2)
            .any(|w| w[1].t_relative_seconds < w[0].t_relative_seconds)
        {
            return Err("frames are not ordered by time".into());
        }
        if frames.iter().any(|f| {
            !f.clarity.is_finite()
                || !f.cents.is_finite()
                || !f.level_rms.is_finite()
                || f.frequency_hz.is_some_and(|hz| !hz.is_finite() || hz <= 0.0)
        }) {
            return Err("frame contains a non-finite value".into());
        }
        if !(self.session_config.reference_a4_hz > 0.0) {
            return Err("reference pitch must be positive".into());
        }
        if let Some(bad) = self
            .images
            .iter()
            .chain(self.raw_audio.as_ref())
            .find(|a| !a.data_uri.starts_with("data:"))
        {
            return Err(format!("attachment {} is not a data URI", bad.filename));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: f64) -> MeasurementFrame {
        MeasurementFrame {
            t_relative_seconds: t,
            frequency_hz: Some(440.0),
            clarity: 0.95,
            cents: 1.5,
            level_rms: 0.2,
        }
    }

    fn payload(frames: Vec<MeasurementFrame>) -> SubmissionPayload {
        SubmissionPayload {
            session_id: None,
            session_config: SessionConfigPayload {
                reference_a4_hz: 440.0,
                instrument_type: "flute".into(),
                display_mode: DisplayMode::Needle,
                transposition_semitones: 0,
            },
            test_payload: TestPayload {
                test_type: TestType::Intonation,
                duration_seconds: 1.0,
                frames,
                raw_spectrum_summary: None,
                summary: None,
            },
            images: vec![],
            raw_audio: None,
        }
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_value(payload(vec![frame(0.0)])).unwrap();
        assert_eq!(json["sessionConfig"]["referenceA4Hz"], 440.0);
        assert_eq!(json["sessionConfig"]["instrumentType"], "flute");
        assert_eq!(json["testPayload"]["testType"], "intonation");
        assert_eq!(json["testPayload"]["frames"][0]["tRelativeSeconds"], 0.0);
        assert_eq!(json["testPayload"]["frames"][0]["levelRms"].as_f64().unwrap() as f32, 0.2);
        assert!(json.get("sessionId").is_none());
        assert!(json["testPayload"].get("rawSpectrumSummary").is_none());
    }

    #[test]
    fn validate_checks_order() {
        assert!(payload(vec![frame(0.0), frame(0.1)]).validate().is_ok());
        assert!(payload(vec![frame(0.1), frame(0.0)]).validate().is_err());
        assert!(payload(vec![]).validate().is_err());
    }

    #[test]
    fn poll_response_parses_and_rejects_unknown_status() {
        let parsed: PollResponse =
            serde_json::from_str(r#"{"status":"Complete","artifacts":["https://x/plot.png"]}"#)
                .unwrap();
        assert_eq!(parsed.status, RemoteStatus::Complete);
        assert_eq!(parsed.artifacts.len(), 1);

        let lower: PollResponse = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(lower.status, RemoteStatus::Running);
        assert!(lower.artifacts.is_empty());

        assert!(serde_json::from_str::<PollResponse>(r#"{"status":"Paused"}"#).is_err());
    }
}
