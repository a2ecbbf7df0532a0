use serde::{Deserialize, Serialize};

/// Side of the square grayscale patch every face is resized to.
pub const CANONICAL_SIZE: u32 = 96;

/// Number of samples in a feature vector (flattened canonical patch).
pub const FEATURE_LEN: usize = (CANONICAL_SIZE * CANONICAL_SIZE) as usize;

/// Axis-aligned face region in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` × `height` image. `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Region {
            x: self.x,
            y: self.y,
            width: w,
            height: h,
        })
    }
}

/// Fixed-length identity descriptor: a flattened, unit-normalised grayscale patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm, accumulated in f64.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Compute Euclidean distance between two vectors.
    ///
    /// Symmetric by construction: `(a - b)^2 == (b - a)^2` in IEEE arithmetic.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Descriptive attributes of an enrolled student.
///
/// `None` means "not supplied": on update the stored value is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub display_name: Option<String>,
    pub course: Option<String>,
    pub branch: Option<String>,
}

impl Attributes {
    /// Trim every field and turn blank values into `None`.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            display_name: clean(self.display_name),
            course: clean(self.course),
            branch: clean(self.branch),
        }
    }

    /// Overwrite fields of `existing` that are supplied here.
    pub fn apply_to(&self, existing: &mut Attributes) {
        if let Some(v) = &self.display_name {
            existing.display_name = Some(v.clone());
        }
        if let Some(v) = &self.course {
            existing.course = Some(v.clone());
        }
        if let Some(v) = &self.branch {
            existing.branch = Some(v.clone());
        }
    }
}
