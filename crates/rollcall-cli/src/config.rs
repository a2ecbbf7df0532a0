use rollcall_core::detector::{DetectionParams, DetectorBackend};
use rollcall_core::{FacePolicy, PipelineSettings};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Haar cascade XML (OpenCV frontal-face model).
    pub cascade_path: PathBuf,
    /// Path to the SQLite registry file.
    pub db_path: PathBuf,
    /// Cascade evaluator: built-in `haar` or `opencv`.
    pub detector: DetectorBackend,
    /// Euclidean distance at or below which a probe matches.
    pub distance_threshold: f32,
    /// What to do when no face is found in a photo.
    pub face_policy: FacePolicy,
    /// Detector pyramid step.
    pub scale_factor: f32,
    /// Raw hits a grouped face needs to exceed.
    pub min_neighbors: u32,
    /// Smallest face side searched, in pixels.
    pub min_face_size: u32,
    /// Recognition scan budget in milliseconds; 0 disables it.
    pub scan_timeout_ms: u64,
    /// Number of engine worker threads.
    pub workers: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let cascade_path = std::env::var("ROLLCALL_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_cascade_path());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("registry.db"));

        let detection = DetectionParams::default();
        let pipeline = PipelineSettings::default();

        Self {
            cascade_path,
            db_path,
            detector: env_parse("ROLLCALL_DETECTOR", DetectorBackend::default()),
            distance_threshold: env_threshold("ROLLCALL_DISTANCE_THRESHOLD", pipeline.distance_threshold),
            face_policy: env_parse("ROLLCALL_FACE_POLICY", pipeline.policy),
            scale_factor: env_parse("ROLLCALL_SCALE_FACTOR", detection.scale_factor),
            min_neighbors: env_parse("ROLLCALL_MIN_NEIGHBORS", detection.min_neighbors),
            min_face_size: env_parse("ROLLCALL_MIN_FACE_SIZE", detection.min_size),
            scan_timeout_ms: env_parse("ROLLCALL_SCAN_TIMEOUT_MS", 0),
            workers: env_parse("ROLLCALL_WORKERS", 2usize).max(1),
        }
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
            ..DetectionParams::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            policy: self.face_policy,
            distance_threshold: self.distance_threshold,
            scan_timeout: (self.scan_timeout_ms > 0).then(|| Duration::from_millis(self.scan_timeout_ms)),
        }
    }
}

/// Parse `key`, falling back to `default` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value; using default");
            default
        }),
        Err(_) => default,
    }
}

/// Like [`env_parse`], but only finite, non-negative distances are accepted.
fn env_threshold(key: &str, default: f32) -> f32 {
    let value = env_parse(key, default);
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        tracing::warn!(key, value, "distance threshold must be finite and >= 0; using default");
        default
    }
}
