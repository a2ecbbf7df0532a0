//! Grayscale patch encoder.
//!
//! Turns a face crop (or the whole photo) into a 9216-dimensional vector:
//! grayscale, bilinear resize to 96×96, row-major flatten, L2-normalise.

use crate::types::{FeatureVector, Region, CANONICAL_SIZE, FEATURE_LEN};
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Stateless, deterministic encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    /// Encode `region` of `image`, or the whole image when `region` is `None`.
    ///
    /// Regions overhanging the image are clamped. A region with no overlap
    /// falls back to the whole image.
    pub fn encode(&self, image: &RgbImage, region: Option<Region>) -> FeatureVector {
        let (width, height) = image.dimensions();
        let bounds = region.and_then(|r| {
            let clamped = r.clamp_to(width, height);
            if clamped.is_none() {
                tracing::warn!(region = ?r, width, height, "face region outside image; encoding whole image");
            }
            clamped
        });

        let gray = match bounds {
            Some(r) => {
                let crop = imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image();
                imageops::grayscale(&crop)
            }
            None => imageops::grayscale(image),
        };

        let patch = imageops::resize(&gray, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle);
        let raw: Vec<f32> = patch.as_raw().iter().map(|&p| p as f32).collect();
        debug_assert_eq!(raw.len(), FEATURE_LEN);

        Self::normalize(raw)
    }

    /// Unit-normalise; an all-zero patch is returned unchanged.
    fn normalize(raw: Vec<f32>) -> FeatureVector {
        let norm = raw
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|&v| (v as f64 / norm) as f32).collect()
        } else {
            raw
        };
        FeatureVector { values }
    }
}
