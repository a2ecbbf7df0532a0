//! Face localisation behind a pluggable [`FaceDetector`] backend.
//!
//! The built-in [`HaarDetector`] slides the cascade window over an image
//! pyramid and groups overlapping hits by neighbour votes. With the `opencv`
//! feature the same cascade XML can instead be run by OpenCV's
//! `CascadeClassifier`. Either way [`FaceLocalizer`] reports the most
//! prominent face.

use crate::cascade::{CascadeClassifier, CascadeError, IntegralImage};
use crate::types::Region;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f32 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_MIN_FACE_SIZE: u32 = 30;
/// Relative tolerance when deciding two hits describe the same face.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("scale factor must be greater than 1.0, got {0}")]
    InvalidScaleFactor(f32),
    #[error(transparent)]
    Cascade(#[from] CascadeError),
    #[error("detector backend {0} is not compiled in (rebuild with --features {0})")]
    BackendUnavailable(DetectorBackend),
    #[error("detection failed: {0}")]
    Backend(String),
}

/// Which engine evaluates the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    /// Built-in pure-Rust evaluator.
    #[default]
    Haar,
    /// OpenCV's `CascadeClassifier`; needs the `opencv` feature.
    Opencv,
}

impl DetectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Haar => "haar",
            Self::Opencv => "opencv",
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haar" => Ok(Self::Haar),
            "opencv" => Ok(Self::Opencv),
            other => Err(format!("unknown detector {other:?} (expected haar or opencv)")),
        }
    }
}

/// Tuning knobs for the sliding-window search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Pyramid step between consecutive scales.
    pub scale_factor: f32,
    /// A grouped face needs strictly more raw hits than this. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest window side (pixels) searched.
    pub min_size: u32,
    /// Largest window side searched; 0 means unbounded.
    pub max_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_FACE_SIZE,
            max_size: 0,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.scale_factor.is_nan() || self.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidScaleFactor(self.scale_factor));
        }
        Ok(())
    }
}

/// Pluggable face detection backend.
///
/// Implementations hold a loaded model and are shared by every worker.
pub trait FaceDetector: Send + Sync + fmt::Debug {
    /// All grouped face regions in a grayscale image, in image coordinates.
    fn detect_gray(&self, gray: &GrayImage) -> Result<Vec<Region>, DetectorError>;

    fn backend(&self) -> DetectorBackend;
}

/// Finds the primary face in a photo.
///
/// Cheap to clone: the detector is shared and never mutated.
#[derive(Debug, Clone)]
pub struct FaceLocalizer {
    detector: Arc<dyn FaceDetector>,
}

impl FaceLocalizer {
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self { detector }
    }

    /// Load the cascade at `path` into the chosen backend.
    pub fn load(
        backend: DetectorBackend,
        path: &Path,
        params: DetectionParams,
    ) -> Result<Self, DetectorError> {
        let detector: Arc<dyn FaceDetector> = match backend {
            DetectorBackend::Haar => {
                let cascade = CascadeClassifier::load(path)?;
                Arc::new(HaarDetector::new(Arc::new(cascade), params)?)
            }
            #[cfg(feature = "opencv")]
            DetectorBackend::Opencv => {
                Arc::new(crate::opencv_cascade::OpenCvDetector::load(path, params)?)
            }
            #[cfg(not(feature = "opencv"))]
            DetectorBackend::Opencv => return Err(DetectorError::BackendUnavailable(backend)),
        };
        Ok(Self::new(detector))
    }

    pub fn backend(&self) -> DetectorBackend {
        self.detector.backend()
    }

    /// Largest detected face, first-found on equal area. `None` if nothing was found.
    pub fn locate(&self, image: &RgbImage) -> Result<Option<Region>, DetectorError> {
        Ok(largest(&self.detect(image)?))
    }

    /// All face regions in an RGB photo.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Region>, DetectorError> {
        let gray = imageops::grayscale(image);
        self.detect_gray(&gray)
    }

    /// All face regions in a grayscale image, clipped to its bounds.
    pub fn detect_gray(&self, gray: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        let (w, h) = gray.dimensions();
        let faces: Vec<Region> = self
            .detector
            .detect_gray(gray)?
            .into_iter()
            .filter_map(|r| r.clamp_to(w, h))
            .collect();
        tracing::debug!(
            backend = %self.detector.backend(),
            faces = faces.len(),
            width = w,
            height = h,
            "face scan"
        );
        Ok(faces)
    }
}

/// Pure-Rust cascade evaluator over an image pyramid.
#[derive(Debug, Clone)]
pub struct HaarDetector {
    cascade: Arc<CascadeClassifier>,
    params: DetectionParams,
}

impl HaarDetector {
    pub fn new(
        cascade: Arc<CascadeClassifier>,
        params: DetectionParams,
    ) -> Result<Self, DetectorError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    fn scan_pyramid(&self, gray: &GrayImage) -> Vec<Region> {
        let (win_w, win_h) = self.cascade.window_size();
        let (img_w, img_h) = gray.dimensions();
        let step = self.params.scale_factor as f64;
        let mut hits = Vec::new();

        let mut factor = 1.0f64;
        loop {
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            // A scaled image exactly the window size still holds one position.
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            let max = self.params.max_size;
            if max > 0 && (window_w > max || window_h > max) {
                break;
            }
            if window_w >= self.params.min_size && window_h >= self.params.min_size {
                self.scan_scale(gray, factor, (scaled_w, scaled_h), (window_w, window_h), &mut hits);
            }
            factor *= step;
        }

        hits
    }

    fn scan_scale(
        &self,
        gray: &GrayImage,
        factor: f64,
        (scaled_w, scaled_h): (u32, u32),
        (window_w, window_h): (u32, u32),
        hits: &mut Vec<Region>,
    ) {
        let scaled: Cow<'_, GrayImage> = if (scaled_w, scaled_h) == gray.dimensions() {
            Cow::Borrowed(gray)
        } else {
            Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
        };
        let integral = IntegralImage::new(&scaled);
        let (win_w, win_h) = self.cascade.window_size();
        // Coarse stride on small scales, every pixel once the pyramid is heavily reduced.
        let stride = if factor > 2.0 { 1 } else { 2 };

        for y in (0..=scaled_h - win_h).step_by(stride) {
            for x in (0..=scaled_w - win_w).step_by(stride) {
                if self.cascade.accepts(&integral, x, y) {
                    hits.push(Region {
                        x: (x as f64 * factor).round() as u32,
                        y: (y as f64 * factor).round() as u32,
                        width: window_w,
                        height: window_h,
                    });
                }
            }
        }
    }
}

impl FaceDetector for HaarDetector {
    fn detect_gray(&self, gray: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        let hits = self.scan_pyramid(gray);
        let raw_hits = hits.len();
        let faces = group_regions(hits, self.params.min_neighbors);
        tracing::trace!(raw_hits, grouped = faces.len(), "haar pyramid scan");
        Ok(faces)
    }

    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Haar
    }
}

/// Pick the region with the largest area; ties keep the earliest one.
pub fn largest(regions: &[Region]) -> Option<Region> {
    regions.iter().copied().fold(None, |best, r| match best {
        Some(b) if b.area() >= r.area() => Some(b),
        _ => Some(r),
    })
}

fn similar(a: &Region, b: &Region) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster overlapping hits, average each cluster and drop weak or nested ones.
///
/// Clusters need strictly more than `min_neighbors` members. A cluster lying
/// inside a stronger one is discarded. With `min_neighbors == 0` the raw hits
/// are returned unchanged.
pub(crate) fn group_regions(regions: Vec<Region>, min_neighbors: u32) -> Vec<Region> {
    if min_neighbors == 0 || regions.is_empty() {
        return regions;
    }

    let n = regions.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&regions[i], &regions[j]) {
                let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Cluster ids in order of first appearance keep the output deterministic.
    let mut label = vec![usize::MAX; n];
    let mut sums: Vec<([u64; 4], u32)> = Vec::new();
    for (i, r) in regions.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if label[root] == usize::MAX {
            label[root] = sums.len();
            sums.push(([0; 4], 0));
        }
        let (acc, votes) = &mut sums[label[root]];
        acc[0] += r.x as u64;
        acc[1] += r.y as u64;
        acc[2] += r.width as u64;
        acc[3] += r.height as u64;
        *votes += 1;
    }

    let clusters: Vec<(Region, u32)> = sums
        .into_iter()
        .map(|(acc, votes)| {
            let avg = |v: u64| (v as f64 / votes as f64).round() as u32;
            let region = Region {
                x: avg(acc[0]),
                y: avg(acc[1]),
                width: avg(acc[2]),
                height: avg(acc[3]),
            };
            (region, votes)
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|&(i, &(r1, n1))| {
            if n1 <= min_neighbors {
                return false;
            }
            let nested = clusters.iter().enumerate().any(|(j, &(r2, n2))| {
                if i == j || n2 <= min_neighbors {
                    return false;
                }
                let dx = (r2.width as f64 * GROUP_EPS).round() as i64;
                let dy = (r2.height as f64 * GROUP_EPS).round() as i64;
                let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
                let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
                x1 >= x2 - dx
                    && y1 >= y2 - dy
                    && x1 + w1 <= x2 + w2 + dx
                    && y1 + h1 <= y2 + h2 + dy
                    && (n2 > n1.max(3) || n1 < 3)
            });
            !nested
        })
        .map(|(_, &(r, _))| r)
        .collect()
}
