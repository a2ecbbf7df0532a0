//! Structured outcome returned to callers of the enrollment and recognition
//! boundary.

use crate::matcher::Decision;
use crate::pipeline::{EnrollOutcome, PipelineError, Recognition};
use crate::types::Attributes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Created,
    Updated,
    Removed,
    Match,
    NoMatchFound,
    ImageDecodeError,
    NoFaceDetected,
    DetectionError,
    EmptyRegistry,
    PersistenceError,
    InvalidRequest,
    NotFound,
    TimedOut,
    EngineUnavailable,
}

impl OutcomeKind {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Removed | Self::Match | Self::NoMatchFound
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub message: String,
}

impl Response {
    pub fn from_enrollment(outcome: &EnrollOutcome) -> Self {
        let message = if outcome.vectorized {
            format!("{} {}", outcome.message(), outcome.code)
        } else {
            format!("{} {} (attributes only)", outcome.message(), outcome.code)
        };
        Self {
            outcome: if outcome.created { OutcomeKind::Created } else { OutcomeKind::Updated },
            code: Some(outcome.code.clone()),
            attributes: None,
            distance: None,
            message,
        }
    }

    pub fn from_recognition(recognition: &Recognition) -> Self {
        match &recognition.decision {
            Decision::Match { code, attributes, distance } => Self {
                outcome: OutcomeKind::Match,
                code: Some(code.clone()),
                attributes: Some(attributes.clone()),
                distance: Some(*distance),
                message: format!("matched {code}"),
            },
            Decision::NoMatch { best_distance } => Self {
                outcome: OutcomeKind::NoMatchFound,
                code: None,
                attributes: None,
                distance: Some(*best_distance),
                message: format!(
                    "no match among {} enrolled identities",
                    recognition.compared
                ),
            },
        }
    }

    pub fn from_error(err: &PipelineError) -> Self {
        Self::with_outcome(err.outcome_kind(), err.to_string())
    }

    pub fn removed(code: &str) -> Self {
        Self {
            outcome: OutcomeKind::Removed,
            code: Some(code.to_string()),
            attributes: None,
            distance: None,
            message: format!("removed {code}"),
        }
    }

    /// A reply carrying only an outcome and a message.
    pub fn with_outcome(outcome: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            outcome,
            code: None,
            attributes: None,
            distance: None,
            message: message.into(),
        }
    }
}

impl PipelineError {
    pub fn outcome_kind(&self) -> OutcomeKind {
        match self {
            PipelineError::ImageDecode(_) => OutcomeKind::ImageDecodeError,
            PipelineError::NoFaceDetected => OutcomeKind::NoFaceDetected,
            PipelineError::Detection(_) => OutcomeKind::DetectionError,
            PipelineError::ReferenceEncode(_) => OutcomeKind::PersistenceError,
            PipelineError::EmptyRegistry => OutcomeKind::EmptyRegistry,
            PipelineError::Persistence(_) => OutcomeKind::PersistenceError,
            PipelineError::MissingCode => OutcomeKind::InvalidRequest,
            PipelineError::ScanTimedOut { .. } => OutcomeKind::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::detector::DetectorError;
    use image::error::{ImageError, LimitError, LimitErrorKind};

    #[test]
    fn test_outcome_kind_wire_names() {
        let json = serde_json::to_string(&OutcomeKind::NoMatchFound).unwrap();
        assert_eq!(json, "\"no_match_found\"");
        let json = serde_json::to_string(&OutcomeKind::ImageDecodeError).unwrap();
        assert_eq!(json, "\"image_decode_error\"");
    }

    #[test]
    fn test_match_response() {
        let rec = Recognition {
            decision: Decision::Match {
                code: "S1".into(),
                attributes: Attributes { display_name: Some("Ada".into()), ..Default::default() },
                distance: 0.25,
            },
            face: None,
            compared: 3,
        };
        let resp = Response::from_recognition(&rec);
        assert_eq!(resp.outcome, OutcomeKind::Match);
        assert_eq!(resp.code.as_deref(), Some("S1"));
        assert_eq!(resp.distance, Some(0.25));
    }

    #[test]
    fn test_no_match_response_has_no_identity() {
        let rec = Recognition {
            decision: Decision::NoMatch { best_distance: 0.9 },
            face: None,
            compared: 2,
        };
        let resp = Response::from_recognition(&rec);
        assert_eq!(resp.outcome, OutcomeKind::NoMatchFound);
        assert_eq!(resp.code, None);
        assert_eq!(resp.attributes, None);
        assert_eq!(resp.distance, Some(0.9));

        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert!(json.get("code").is_none(), "no identity on the wire: {json}");
    }

    #[test]
    fn test_enrollment_response() {
        let outcome = EnrollOutcome {
            record_id: 4,
            code: "S4".into(),
            created: false,
            vectorized: false,
            face: None,
        };
        let resp = Response::from_enrollment(&outcome);
        assert_eq!(resp.outcome, OutcomeKind::Updated);
        assert!(resp.message.contains("attributes only"));
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (PipelineError::ImageDecode(CodecError::Empty), OutcomeKind::ImageDecodeError),
            (PipelineError::NoFaceDetected, OutcomeKind::NoFaceDetected),
            (
                PipelineError::Detection(DetectorError::Backend("model crashed".into())),
                OutcomeKind::DetectionError,
            ),
            (PipelineError::EmptyRegistry, OutcomeKind::EmptyRegistry),
            (PipelineError::MissingCode, OutcomeKind::InvalidRequest),
            (PipelineError::ScanTimedOut { compared: 7 }, OutcomeKind::TimedOut),
        ];
        for (err, kind) in cases {
            let resp = Response::from_error(&err);
            assert_eq!(resp.outcome, kind, "{err}");
            assert!(!resp.outcome.is_success());
        }
    }

    #[test]
    fn test_reference_encode_failure_is_not_a_decode_error() {
        // The upload decoded fine; failing to store it is a persistence problem.
        let cause = ImageError::Limits(LimitError::from_kind(LimitErrorKind::DimensionError));
        let err = PipelineError::ReferenceEncode(CodecError::Encode(cause));
        let resp = Response::from_error(&err);
        assert_eq!(resp.outcome, OutcomeKind::PersistenceError);
        assert!(resp.message.contains("re-encoding reference image"), "{}", resp.message);
    }

    #[test]
    fn test_removed_reply() {
        let resp = Response::removed("S9");
        assert_eq!(resp.outcome, OutcomeKind::Removed);
        assert!(resp.outcome.is_success());
        assert_eq!(resp.code.as_deref(), Some("S9"));
        assert_eq!(resp.message, "removed S9");

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["outcome"], "removed");
        assert!(json.get("distance").is_none());
    }
}
