//! Recognition service wire model and the tagged submission outcome.

use crate::types::{Action, BoundingBox, RecognitionObservation, Subject};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("malformed recognition response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A face the service matched to an enrolled student.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognizedFace {
    pub student_id: String,
    pub name: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnrecognizedFace {
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    #[serde(default)]
    pub score: Option<f32>,
}

/// JSON body returned by the recognition endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognizeResponse {
    #[serde(default)]
    pub recognized: Vec<RecognizedFace>,
    #[serde(default)]
    pub unrecognized_count: u32,
    #[serde(default)]
    pub unrecognized_faces: Vec<UnrecognizedFace>,
    #[serde(default)]
    pub processing_time_ms: f64,
    #[serde(default)]
    pub total_faces: Option<u32>,
}

impl RecognizeResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self, RecognitionError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Fold the response into observations stamped with `observed_at`.
    pub fn into_result(self, observed_at: Instant) -> RecognitionResult {
        let unrecognized_count = self
            .unrecognized_count
            .max(self.unrecognized_faces.len() as u32);
        let total_faces = self
            .total_faces
            .unwrap_or(self.recognized.len() as u32 + unrecognized_count);

        let mut observations: Vec<RecognitionObservation> = self
            .recognized
            .into_iter()
            .map(|face| RecognitionObservation {
                subject: Some(Subject::new(face.student_id, face.name)),
                confidence: face.score.clamp(0.0, 1.0),
                bbox: face.bbox.map(BoundingBox),
                action: face.action.as_deref().and_then(Action::parse),
                observed_at,
            })
            .collect();

        observations.extend(self.unrecognized_faces.into_iter().map(|face| {
            RecognitionObservation {
                subject: None,
                confidence: face.score.unwrap_or(0.0).clamp(0.0, 1.0),
                bbox: face.bbox.map(BoundingBox),
                action: None,
                observed_at,
            }
        }));

        RecognitionResult {
            observations,
            unrecognized_count,
            total_faces,
            processing_time_ms: self.processing_time_ms,
        }
    }
}

/// Structured result of one successful submission.
#[derive(Debug, Clone, Default)]
pub struct RecognitionResult {
    pub observations: Vec<RecognitionObservation>,
    pub unrecognized_count: u32,
    pub total_faces: u32,
    pub processing_time_ms: f64,
}

impl RecognitionResult {
    pub fn recognized_count(&self) -> usize {
        self.observations.iter().filter(|o| o.is_recognized()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request exceeded the submission timeout or the server signalled overload.
    Timeout,
    /// The service could not be reached.
    Network,
    /// Non-success HTTP status.
    Server(u16),
    /// The body was not a valid recognition response.
    Decode,
}

/// Submission failure, reported as data so the capture loop keeps running.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SubmitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

/// Outcome of `submit_frame`: either a result or a tagged failure, never a panic or `Err`.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Recognized(RecognitionResult),
    Failed(SubmitFailure),
}

impl SubmitOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failed(f) if f.is_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let body = br#"{
            "recognized": [
                {"student_id": "S1", "name": "Ada", "score": 0.91, "action": "check-in", "bbox": [1, 2, 3, 4]},
                {"student_id": "S2", "name": "Grace", "score": 0.75}
            ],
            "unrecognized_count": 1,
            "unrecognized_faces": [{"bbox": [5, 6, 7, 8]}],
            "processing_time_ms": 123.5,
            "total_faces": 3
        }"#;
        let result = RecognizeResponse::from_slice(body)
            .unwrap()
            .into_result(Instant::now());

        assert_eq!(result.observations.len(), 3);
        assert_eq!(result.recognized_count(), 2);
        assert_eq!(result.unrecognized_count, 1);
        assert_eq!(result.total_faces, 3);
        assert!((result.processing_time_ms - 123.5).abs() < 1e-9);

        let first = &result.observations[0];
        assert_eq!(first.subject.as_ref().unwrap().id.as_str(), "S1");
        assert_eq!(first.action, Some(Action::CheckIn));
        assert_eq!(first.bbox, Some(BoundingBox([1.0, 2.0, 3.0, 4.0])));

        let second = &result.observations[1];
        assert_eq!(second.action, None);
        assert_eq!(second.bbox, None);

        assert!(result.observations[2].subject.is_none());
    }

    #[test]
    fn test_total_faces_defaults_to_sum() {
        let body = br#"{
            "recognized": [{"student_id": "S1", "name": "Ada", "score": 0.9}],
            "unrecognized_count": 2,
            "unrecognized_faces": [],
            "processing_time_ms": 10
        }"#;
        let result = RecognizeResponse::from_slice(body)
            .unwrap()
            .into_result(Instant::now());
        assert_eq!(result.total_faces, 3);
    }

    #[test]
    fn test_empty_object_is_empty_result() {
        let result = RecognizeResponse::from_slice(b"{}")
            .unwrap()
            .into_result(Instant::now());
        assert!(result.observations.is_empty());
        assert_eq!(result.total_faces, 0);
    }

    #[test]
    fn test_malformed_body() {
        assert!(RecognizeResponse::from_slice(b"<html>").is_err());
    }

    #[test]
    fn test_unknown_action_is_none() {
        let body = br#"{"recognized": [{"student_id": "S1", "name": "Ada", "score": 0.9, "action": "already_marked"}]}"#;
        let result = RecognizeResponse::from_slice(body)
            .unwrap()
            .into_result(Instant::now());
        assert_eq!(result.observations[0].action, None);
    }

    #[test]
    fn test_outcome_timeout_flag() {
        let timeout = SubmitOutcome::Failed(SubmitFailure::new(FailureKind::Timeout, "slow"));
        let network = SubmitOutcome::Failed(SubmitFailure::new(FailureKind::Network, "down"));
        assert!(timeout.is_timeout());
        assert!(!network.is_timeout());
        assert!(!SubmitOutcome::Recognized(RecognitionResult::default()).is_timeout());
    }
}
