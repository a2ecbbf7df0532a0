//! OpenCV `CascadeClassifier` backend.
//!
//! Runs the same OpenCV cascade XML through `detect_multi_scale`, which does
//! its own pyramid, scanning and neighbour grouping.

use crate::cascade::CascadeError;
use crate::detector::{DetectionParams, DetectorBackend, DetectorError, FaceDetector};
use crate::types::Region;
use image::GrayImage;
use opencv::core::{Mat, Rect, Size, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, objdetect};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

pub struct OpenCvDetector {
    // detect_multi_scale takes &mut self, so calls from different workers serialise here.
    classifier: Mutex<objdetect::CascadeClassifier>,
    params: DetectionParams,
}

impl fmt::Debug for OpenCvDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenCvDetector").field("params", &self.params).finish_non_exhaustive()
    }
}

fn backend_error(err: opencv::Error) -> DetectorError {
    DetectorError::Backend(err.to_string())
}

impl OpenCvDetector {
    pub fn load(path: &Path, params: DetectionParams) -> Result<Self, DetectorError> {
        params.validate()?;
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()).into());
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| CascadeError::Invalid(format!("non UTF-8 path {}", path.display())))?;

        let classifier = objdetect::CascadeClassifier::new(path_str).map_err(backend_error)?;
        // OpenCV reports an unreadable model as an empty classifier, not an error.
        if classifier.empty().map_err(backend_error)? {
            return Err(CascadeError::Invalid(format!("OpenCV could not load {}", path.display())).into());
        }

        tracing::info!(path = %path.display(), "loaded OpenCV cascade");
        Ok(Self { classifier: Mutex::new(classifier), params })
    }
}

/// Hand a grayscale raster to OpenCV as an in-memory PGM.
fn to_mat(gray: &GrayImage) -> Result<Mat, DetectorError> {
    let (w, h) = gray.dimensions();
    let mut pgm = format!("P5\n{w} {h}\n255\n").into_bytes();
    pgm.extend_from_slice(gray.as_raw());
    imgcodecs::imdecode(&Vector::<u8>::from_slice(&pgm), imgcodecs::IMREAD_GRAYSCALE)
        .map_err(backend_error)
}

fn to_region(rect: Rect) -> Region {
    Region {
        x: rect.x.max(0) as u32,
        y: rect.y.max(0) as u32,
        width: rect.width.max(0) as u32,
        height: rect.height.max(0) as u32,
    }
}

impl FaceDetector for OpenCvDetector {
    fn detect_gray(&self, gray: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        let mat = to_mat(gray)?;
        let min = self.params.min_size as i32;
        let max = self.params.max_size as i32;
        let mut faces = Vector::<Rect>::new();

        let mut classifier = self
            .classifier
            .lock()
            .map_err(|_| DetectorError::Backend("cascade lock poisoned".into()))?;
        classifier
            .detect_multi_scale(
                &mat,
                &mut faces,
                self.params.scale_factor as f64,
                self.params.min_neighbors as i32,
                0,
                Size::new(min, min),
                Size::new(max, max),
            )
            .map_err(backend_error)?;

        Ok(faces.iter().map(to_region).collect())
    }

    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Opencv
    }
}
