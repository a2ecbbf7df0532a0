//! Boosted Haar cascade model and window evaluation.
//!
//! Loads OpenCV-format cascade XML (`<cascade>` with `BOOST` stages and
//! `HAAR` features) and evaluates it against integral images. Only upright
//! features are supported; tilted features and LBP cascades are rejected
//! at load time.

use image::GrayImage;
use std::path::Path;
use thiserror::Error;

/// Stage thresholds are relaxed by this amount at load time.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; install OpenCV's haarcascades or set ROLLCALL_CASCADE_PATH")]
    NotFound(String),
    #[error("reading cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade xml: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    /// Weighted rectangle sum for the window whose top-left corner is (x, y).
    fn raw_value(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| {
                integral.sum(x + r.x, y + r.y, r.width, r.height) as f64 * r.weight as f64
            })
            .sum()
    }
}

/// One split of a weak classifier tree.
///
/// Child indices follow the OpenCV convention: positive values point at
/// another node, zero or negative values `-i` select leaf `i`.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

impl WeakClassifier {
    fn predict(&self, mut feature_value: impl FnMut(usize) -> f32) -> f32 {
        let mut idx: i32 = 0;
        loop {
            let node = &self.nodes[idx as usize];
            idx = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                break;
            }
        }
        self.leaves[(-idx) as usize]
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// Summed-area tables of a grayscale image (plain and squared).
///
/// Both tables are `(width + 1) × (height + 1)` with a zero first row and column.
pub struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn corners(&self, x: u32, y: u32, w: u32, h: u32) -> [usize; 4] {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        [
            y0 * self.stride + x0,
            y0 * self.stride + x1,
            y1 * self.stride + x0,
            y1 * self.stride + x1,
        ]
    }

    /// Sum of pixels in the rectangle `[x, x+w) × [y, y+h)`.
    pub fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        self.sum[br] + self.sum[tl] - self.sum[tr] - self.sum[bl]
    }

    /// Sum of squared pixels in the rectangle `[x, x+w) × [y, y+h)`.
    pub fn squared_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        self.sq_sum[br] + self.sq_sum[tl] - self.sq_sum[tr] - self.sq_sum[bl]
    }
}

/// A loaded, immutable Haar cascade.
///
/// Holds no per-call state, so a single instance can be shared across
/// threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CascadeClassifier {
    width: u32,
    height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl CascadeClassifier {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported(
                    "no <cascade> element (legacy pre-2.4 cascade format?)".into(),
                )
            })?;

        let stage_type = child_text(root, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = child_text(root, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let width: u32 = parse_token(&child_text(root, "width")?)?;
        let height: u32 = parse_token(&child_text(root, "height")?)?;
        // Variance normalisation uses the window inset by one pixel.
        if width < 3 || height < 3 {
            return Err(CascadeError::Invalid(format!("window {width}x{height} too small")));
        }

        let features = items(child(root, "features")?)
            .map(|node| parse_feature(node, width, height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .map(|node| parse_stage(node, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self { width, height, stages, features })
    }

    /// Detection window size (width, height) the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Run every stage on the window at (x, y). Early-exits on the first rejecting stage.
    pub fn accepts(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let Some(norm) = self.variance_norm(integral, x, y) else {
            return false;
        };

        for stage in &self.stages {
            let mut stage_sum = 0.0f32;
            for weak in &stage.classifiers {
                stage_sum += weak.predict(|f| {
                    (self.features[f].raw_value(integral, x, y) * norm) as f32
                });
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    /// Reciprocal of `area × stddev` over the inset window.
    ///
    /// Only perfectly flat windows yield `None`; any texture at all, however
    /// faint, is handed to the stages.
    fn variance_norm(&self, integral: &IntegralImage, x: u32, y: u32) -> Option<f64> {
        let (w, h) = (self.width - 2, self.height - 2);
        let area = (w * h) as f64;
        let sum = integral.sum(x + 1, y + 1, w, h) as f64;
        let sq_sum = integral.squared_sum(x + 1, y + 1, w, h) as f64;

        // Exact in f64: both terms are integers well below 2^53.
        let nf = area * sq_sum - sum * sum;
        if nf <= 0.0 {
            return None;
        }
        Some(1.0 / nf.sqrt())
    }
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Result<roxmltree::Node<'a, 'input>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| CascadeError::Invalid(format!("missing <{name}>")))
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Result<String, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or("").trim().to_string())
}

/// Element children of a sequence node (OpenCV writes list items as `<_>`).
fn items<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn parse_token<T: std::str::FromStr>(token: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("bad number {token:?}")))
}

fn parse_feature(
    node: roxmltree::Node<'_, '_>,
    win_w: u32,
    win_h: u32,
) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child_text(node, "tilted") {
        if tilted != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let mut rects = Vec::new();
    for rect in items(child(node, "rects")?) {
        let text = rect.text().unwrap_or("");
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() != 5 {
            return Err(CascadeError::Invalid(format!("feature rect {text:?}")));
        }
        let r = WeightedRect {
            x: parse_token(tokens[0])?,
            y: parse_token(tokens[1])?,
            width: parse_token(tokens[2])?,
            height: parse_token(tokens[3])?,
            weight: parse_token(tokens[4])?,
        };
        if r.x + r.width > win_w || r.y + r.height > win_h {
            return Err(CascadeError::Invalid(format!(
                "feature rect {text:?} outside {win_w}x{win_h} window"
            )));
        }
        rects.push(r);
    }

    if rects.is_empty() {
        return Err(CascadeError::Invalid("feature without rects".into()));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: roxmltree::Node<'_, '_>, num_features: usize) -> Result<Stage, CascadeError> {
    let threshold: f32 = parse_token(&child_text(node, "stageThreshold")?)?;

    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|weak| parse_weak(weak, num_features))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak(
    node: roxmltree::Node<'_, '_>,
    num_features: usize,
) -> Result<WeakClassifier, CascadeError> {
    let node_text = child_text(node, "internalNodes")?;
    let tokens: Vec<&str> = node_text.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(CascadeError::Invalid(format!(
            "internalNodes must be groups of 4, got {} values",
            tokens.len()
        )));
    }

    let nodes = tokens
        .chunks(4)
        .map(|t| {
            Ok(Node {
                left: parse_token(t[0])?,
                right: parse_token(t[1])?,
                feature: parse_token(t[2])?,
                threshold: parse_token(t[3])?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    let leaves = child_text(node, "leafValues")?
        .split_whitespace()
        .map(parse_token)
        .collect::<Result<Vec<f32>, _>>()?;

    for (i, n) in nodes.iter().enumerate() {
        if n.feature >= num_features {
            return Err(CascadeError::Invalid(format!(
                "feature index {} out of range ({num_features} features)",
                n.feature
            )));
        }
        for next in [n.left, n.right] {
            let valid = if next > 0 {
                // Children must come after their parent, which rules out cycles.
                (next as usize) > i && (next as usize) < nodes.len()
            } else {
                (next.unsigned_abs() as usize) < leaves.len()
            };
            if !valid {
                return Err(CascadeError::Invalid(format!("node {i} has bad child {next}")));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use image::Luma;

    #[test]
    fn test_integral_sum() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let ii = IntegralImage::new(&gray);
        // Whole image: 0 + 1 + ... + 11
        assert_eq!(ii.sum(0, 0, 4, 3), 66);
        // Pixels 5, 6, 9, 10
        assert_eq!(ii.sum(1, 1, 2, 2), 30);
        assert_eq!(ii.squared_sum(1, 1, 2, 2), 25 + 36 + 81 + 100);
    }

    #[test]
    fn test_load_texture_cascade() {
        let cascade = CascadeClassifier::from_xml(fixtures::TEXTURE_CASCADE_XML).unwrap();
        assert_eq!(cascade.window_size(), (24, 24));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.features.len(), 1);
        assert!((cascade.stages[0].threshold + STAGE_THRESHOLD_EPS).abs() < 1e-9);
    }

    #[test]
    fn test_flat_window_rejected() {
        let cascade = CascadeClassifier::from_xml(fixtures::TEXTURE_CASCADE_XML).unwrap();
        let ii = IntegralImage::new(&GrayImage::from_pixel(24, 24, Luma([128])));
        assert!(!cascade.accepts(&ii, 0, 0));
    }

    #[test]
    fn test_textured_window_accepted() {
        let cascade = CascadeClassifier::from_xml(fixtures::TEXTURE_CASCADE_XML).unwrap();
        let checker = GrayImage::from_fn(24, 24, |x, y| {
            Luma([if (x / 3 + y / 3) % 2 == 0 { 40 } else { 220 }])
        });
        let ii = IntegralImage::new(&checker);
        assert!(cascade.accepts(&ii, 0, 0));
    }

    #[test]
    fn test_low_contrast_window_accepted() {
        // Standard deviation 5 gray levels: dim but textured, so the stages decide.
        let cascade = CascadeClassifier::from_xml(fixtures::TEXTURE_CASCADE_XML).unwrap();
        let faint = GrayImage::from_fn(24, 24, |x, y| {
            Luma([if (x + y) % 2 == 0 { 125 } else { 135 }])
        });
        let ii = IntegralImage::new(&faint);
        assert!(cascade.accepts(&ii, 0, 0));
    }

    #[test]
    fn test_single_level_step_is_not_flat() {
        // One pixel differing by one gray level is still texture.
        let cascade = CascadeClassifier::from_xml(fixtures::TEXTURE_CASCADE_XML).unwrap();
        let mut nearly_flat = GrayImage::from_pixel(24, 24, Luma([100]));
        nearly_flat.put_pixel(12, 12, Luma([101]));
        let ii = IntegralImage::new(&nearly_flat);
        assert!(cascade.variance_norm(&ii, 0, 0).is_some());
        assert!(cascade.accepts(&ii, 0, 0));
    }

    #[test]
    fn test_stump_direction() {
        // Bottom-brighter-than-top detector: accepts only when the lower half wins.
        let cascade = CascadeClassifier::from_xml(fixtures::GRADIENT_CASCADE_XML).unwrap();
        let bright_bottom = GrayImage::from_fn(24, 24, |_, y| Luma([if y < 12 { 20 } else { 230 }]));
        let bright_top = GrayImage::from_fn(24, 24, |_, y| Luma([if y < 12 { 230 } else { 20 }]));
        assert!(cascade.accepts(&IntegralImage::new(&bright_bottom), 0, 0));
        assert!(!cascade.accepts(&IntegralImage::new(&bright_top), 0, 0));
    }

    #[test]
    fn test_tree_weak_classifier() {
        // Two-node tree: node 0 sends low values to leaf 0, high values to node 1.
        let weak = WeakClassifier {
            nodes: vec![
                Node { left: 0, right: 1, feature: 0, threshold: 0.0 },
                Node { left: -1, right: -2, feature: 1, threshold: 0.5 },
            ],
            leaves: vec![-1.0, 0.25, 2.0],
        };
        assert_eq!(weak.predict(|f| if f == 0 { -1.0 } else { 0.0 }), -1.0);
        assert_eq!(weak.predict(|f| if f == 0 { 1.0 } else { 0.0 }), 0.25);
        assert_eq!(weak.predict(|f| if f == 0 { 1.0 } else { 1.0 }), 2.0);
    }

    #[test]
    fn test_reject_legacy_format() {
        let xml = r#"<opencv_storage><haarcascade_frontalface_alt type_id="opencv-haar-classifier"><size>20 20</size></haarcascade_frontalface_alt></opencv_storage>"#;
        let err = CascadeClassifier::from_xml(xml).unwrap_err();
        assert!(matches!(err, CascadeError::Unsupported(_)), "got {err}");
    }

    #[test]
    fn test_reject_lbp() {
        let xml = fixtures::TEXTURE_CASCADE_XML.replace("<featureType>HAAR", "<featureType>LBP");
        let err = CascadeClassifier::from_xml(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Unsupported(_)), "got {err}");
    }

    #[test]
    fn test_reject_tilted() {
        let xml = fixtures::TEXTURE_CASCADE_XML.replace("</rects>", "</rects><tilted>1</tilted>");
        let err = CascadeClassifier::from_xml(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Unsupported(_)), "got {err}");
    }

    #[test]
    fn test_reject_feature_index_out_of_range() {
        let xml = fixtures::TEXTURE_CASCADE_XML.replace("0 -1 0 -1.0e+30", "0 -1 7 -1.0e+30");
        let err = CascadeClassifier::from_xml(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(_)), "got {err}");
    }

    #[test]
    fn test_reject_rect_outside_window() {
        let xml = fixtures::TEXTURE_CASCADE_XML.replace("0 0 24 24 1.", "4 4 24 24 1.");
        let err = CascadeClassifier::from_xml(&xml).unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(_)), "got {err}");
    }

    #[test]
    fn test_reject_malformed_xml() {
        let err = CascadeClassifier::from_xml("<cascade><stageType>").unwrap_err();
        assert!(matches!(err, CascadeError::Xml(_)), "got {err}");
    }

    #[test]
    fn test_load_missing_file() {
        let err = CascadeClassifier::load("/nonexistent/cascade.xml").unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }
}
