//! Enrollment and recognition pipelines.
//!
//! Both pipelines run Localizer → Encoder under one shared [`FacePolicy`],
//! so an identity is always enrolled and probed the same way.

use crate::codec::{self, CodecError};
use crate::detector::{DetectorError, FaceLocalizer};
use crate::encoder::FeatureEncoder;
use crate::matcher::{Decision, EuclideanMatcher, MatchError, Matcher};
use crate::registry::{Registry, RegistryError};
use crate::types::{Attributes, FeatureVector, Region};
use crate::vector_store;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default match threshold for unit-normalised 96×96 patches.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.40;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] CodecError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("re-encoding reference image failed: {0}")]
    ReferenceEncode(#[source] CodecError),
    #[error("no enrolled identities to compare against")]
    EmptyRegistry,
    #[error("registry error: {0}")]
    Persistence(#[from] RegistryError),
    #[error("identity code is required")]
    MissingCode,
    #[error("recognition scan timed out after {compared} comparisons")]
    ScanTimedOut { compared: usize },
}

/// What to do when the localizer finds no face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacePolicy {
    /// Reject the photo with [`PipelineError::NoFaceDetected`].
    #[default]
    Strict,
    /// Encode the whole photo instead.
    Lenient,
}

impl FromStr for FacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown face policy {other:?} (expected strict or lenient)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub policy: FacePolicy,
    /// Largest Euclidean distance still counted as a match.
    pub distance_threshold: f32,
    /// Recognition scan budget; `None` scans without a deadline.
    pub scan_timeout: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            policy: FacePolicy::default(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            scan_timeout: None,
        }
    }
}

/// Enrollment request: identity attributes plus an optional photo.
#[derive(Debug, Clone, Default)]
pub struct EnrollRequest {
    pub code: String,
    pub attributes: Attributes,
    pub image: Option<Vec<u8>>,
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollOutcome {
    pub record_id: i64,
    pub code: String,
    pub created: bool,
    /// Whether a new photo/vector pair was stored.
    pub vectorized: bool,
    /// Face region used for the vector, `None` for whole-image fallback or no photo.
    pub face: Option<Region>,
}

impl EnrollOutcome {
    pub fn message(&self) -> &'static str {
        if self.created {
            "created"
        } else {
            "updated"
        }
    }
}

/// Result of a completed recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub decision: Decision,
    /// Probe face region, `None` for whole-image fallback.
    pub face: Option<Region>,
    /// Number of enrolled identities compared.
    pub compared: usize,
}

/// Localizer, encoder and matcher bundled with the shared settings.
///
/// Holds no per-request state; clone it freely across threads.
#[derive(Debug, Clone)]
pub struct FacePipeline {
    localizer: FaceLocalizer,
    encoder: FeatureEncoder,
    matcher: EuclideanMatcher,
    settings: PipelineSettings,
}

impl FacePipeline {
    pub fn new(localizer: FaceLocalizer, settings: PipelineSettings) -> Self {
        Self {
            localizer,
            encoder: FeatureEncoder,
            matcher: EuclideanMatcher,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn localizer(&self) -> &FaceLocalizer {
        &self.localizer
    }

    /// Localize and encode a decoded photo under the configured policy.
    pub fn vectorize(
        &self,
        image: &RgbImage,
    ) -> Result<(Option<Region>, FeatureVector), PipelineError> {
        let face = self.localizer.locate(image)?;
        tracing::debug!(stage = "detected", face = ?face, "face localisation finished");

        if face.is_none() {
            match self.settings.policy {
                FacePolicy::Strict => return Err(PipelineError::NoFaceDetected),
                FacePolicy::Lenient => {
                    tracing::debug!("no face found; encoding whole image");
                }
            }
        }

        let vector = self.encoder.encode(image, face);
        tracing::debug!(stage = "encoded", len = vector.len(), "feature vector ready");
        Ok((face, vector))
    }

    /// Create or update an identity, optionally (re)computing its vector.
    ///
    /// Every failure happens before the single registry write, so a failed
    /// enrollment leaves the stored record untouched.
    pub fn enroll<R: Registry + ?Sized>(
        &self,
        registry: &mut R,
        request: EnrollRequest,
    ) -> Result<EnrollOutcome, PipelineError> {
        let code = request.code.trim().to_string();
        if code.is_empty() {
            return Err(PipelineError::MissingCode);
        }
        let attributes = request.attributes.normalized();

        let (face, enrollment) = match request.image.as_deref() {
            Some(bytes) => {
                tracing::debug!(code = %code, stage = "decoding", bytes = bytes.len(), "enroll");
                let image = codec::decode(bytes)?;
                let (face, vector) = self.vectorize(&image)?;
                let reference = codec::encode_png(&image).map_err(PipelineError::ReferenceEncode)?;
                (face, Some((reference, vector)))
            }
            None => (None, None),
        };
        let vectorized = enrollment.is_some();

        let result = match enrollment {
            Some((reference, vector)) => {
                vector_store::write_identity(registry, &code, attributes, Some((reference, &vector)))?
            }
            None => vector_store::write_identity(registry, &code, attributes, None)?,
        };

        tracing::info!(
            code = %code,
            record_id = result.record_id,
            created = result.created,
            vectorized,
            "identity enrolled"
        );

        Ok(EnrollOutcome {
            record_id: result.record_id,
            code,
            created: result.created,
            vectorized,
            face,
        })
    }

    /// Identify the enrolled person closest to the probe photo.
    pub fn recognize<R: Registry + ?Sized>(
        &self,
        registry: &R,
        probe: &[u8],
    ) -> Result<Recognition, PipelineError> {
        tracing::debug!(stage = "decoding", bytes = probe.len(), "recognize");
        let image = codec::decode(probe)?;

        let (face, vector) = self.vectorize(&image)?;

        let gallery = vector_store::gallery(registry)?;
        if gallery.is_empty() {
            return Err(PipelineError::EmptyRegistry);
        }
        tracing::debug!(stage = "matching", candidates = gallery.len(), "scanning gallery");

        let deadline = self.settings.scan_timeout.map(|t| Instant::now() + t);
        let decision = self
            .matcher
            .compare(&vector, &gallery, self.settings.distance_threshold, deadline)
            .map_err(|e| match e {
                MatchError::EmptyGallery => PipelineError::EmptyRegistry,
                MatchError::DeadlineExceeded { compared } => PipelineError::ScanTimedOut { compared },
            })?;

        match &decision {
            Decision::Match { code, distance, .. } => {
                tracing::info!(code = %code, distance, "recognized");
            }
            Decision::NoMatch { best_distance } => {
                tracing::info!(
                    best_distance,
                    threshold = self.settings.distance_threshold,
                    "no identity within threshold"
                );
            }
        }

        Ok(Recognition {
            decision,
            face,
            compared: gallery.len(),
        })
    }
}
