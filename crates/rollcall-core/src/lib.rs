//! rollcall-core — Face enrollment and recognition engine.
//!
//! Localises faces with an OpenCV Haar cascade, encodes the crop as a
//! unit-normalised 96×96 grayscale patch and identifies the nearest
//! enrolled student by Euclidean distance.
//!
//! The cascade runs on the built-in evaluator by default. Build with the
//! `opencv` feature to run it through OpenCV instead.

pub mod cascade;
pub mod codec;
pub mod detector;
pub mod encoder;
pub mod matcher;
#[cfg(feature = "opencv")]
pub mod opencv_cascade;
pub mod pipeline;
pub mod registry;
pub mod response;
pub mod types;
pub mod vector_store;

#[cfg(test)]
mod fixtures;

use std::path::PathBuf;

pub use cascade::{CascadeClassifier, CascadeError};
pub use detector::{
    DetectionParams, DetectorBackend, DetectorError, FaceDetector, FaceLocalizer, HaarDetector,
};
pub use encoder::FeatureEncoder;
pub use matcher::{Decision, EuclideanMatcher, GalleryEntry, Matcher};
pub use pipeline::{
    EnrollOutcome, EnrollRequest, FacePipeline, FacePolicy, PipelineError, PipelineSettings,
    Recognition,
};
pub use registry::{MemoryRegistry, Registry, RegistryError};
pub use response::{OutcomeKind, Response};
pub use types::{Attributes, FeatureVector, Region, CANONICAL_SIZE, FEATURE_LEN};

const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

const CASCADE_DIRS: &[&str] = &[
    "/usr/share/opencv4/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/share/rollcall",
];

/// First installed copy of the frontal-face cascade, or the first
/// candidate path if none exists.
pub fn default_cascade_path() -> PathBuf {
    CASCADE_DIRS
        .iter()
        .map(|dir| PathBuf::from(dir).join(CASCADE_FILE))
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(CASCADE_DIRS[0]).join(CASCADE_FILE))
}
