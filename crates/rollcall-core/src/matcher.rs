use crate::types::{Attributes, FeatureVector};
use std::time::Instant;
use thiserror::Error;

/// A vectorised identity loaded from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub code: String,
    pub attributes: Attributes,
    pub vector: FeatureVector,
}

/// Outcome of comparing a probe against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Closest identity is within the threshold.
    Match {
        code: String,
        attributes: Attributes,
        distance: f32,
    },
    /// Closest identity is farther than the threshold.
    NoMatch { best_distance: f32 },
}

impl Decision {
    pub fn is_match(&self) -> bool {
        matches!(self, Decision::Match { .. })
    }

    pub fn distance(&self) -> f32 {
        match self {
            Decision::Match { distance, .. } => *distance,
            Decision::NoMatch { best_distance } => *best_distance,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("gallery is empty")]
    EmptyGallery,
    #[error("deadline passed after {compared} comparisons")]
    DeadlineExceeded { compared: usize },
}

/// Strategy for comparing a probe vector against a gallery of enrolled identities.
pub trait Matcher {
    /// `deadline`, if set, is checked between distance computations, never inside one.
    fn compare(
        &self,
        probe: &FeatureVector,
        gallery: &[GalleryEntry],
        threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<Decision, MatchError>;
}

/// Linear-scan nearest neighbour under Euclidean distance.
///
/// The first entry seeds the running minimum; later entries replace it only
/// when strictly closer, so ties go to the earliest entry in gallery order.
/// A best distance equal to the threshold counts as a match.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &FeatureVector,
        gallery: &[GalleryEntry],
        threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<Decision, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if i > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(MatchError::DeadlineExceeded { compared: i });
            }
            let distance = probe.euclidean_distance(&entry.vector);
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((i, distance)),
            }
        }

        let (idx, distance) = best.ok_or(MatchError::EmptyGallery)?;
        if distance <= threshold {
            Ok(Decision::Match {
                code: gallery[idx].code.clone(),
                attributes: gallery[idx].attributes.clone(),
                distance,
            })
        } else {
            Ok(Decision::NoMatch { best_distance: distance })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(code: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            code: code.into(),
            attributes: Attributes::default(),
            vector: FeatureVector { values: values.to_vec() },
        }
    }

    fn probe(values: &[f32]) -> FeatureVector {
        FeatureVector { values: values.to_vec() }
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            entry("decoy1", &[0.0, 1.0, 0.0]),
            entry("decoy2", &[0.0, 0.0, 1.0]),
            entry("match", &[1.0, 0.0, 0.0]),
        ];
        let decision = EuclideanMatcher
            .compare(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.5, None)
            .unwrap();
        match decision {
            Decision::Match { code, distance, .. } => {
                assert_eq!(code, "match");
                assert_eq!(distance, 0.0);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_no_match_reports_best_distance() {
        let gallery = vec![entry("far", &[0.0, 1.0]), entry("farther", &[-1.0, 0.0])];
        let decision = EuclideanMatcher
            .compare(&probe(&[1.0, 0.0]), &gallery, 0.5, None)
            .unwrap();
        assert_eq!(decision, Decision::NoMatch { best_distance: 2.0f32.sqrt() });
    }

    #[test]
    fn test_tie_keeps_earliest() {
        let gallery = vec![entry("first", &[0.0, 1.0]), entry("second", &[0.0, -1.0])];
        let decision = EuclideanMatcher
            .compare(&probe(&[0.0, 0.0]), &gallery, 1.0, None)
            .unwrap();
        assert!(matches!(decision, Decision::Match { ref code, .. } if code == "first"));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = vec![entry("S1", &[3.0, 4.0])];
        let at = EuclideanMatcher.compare(&probe(&[0.0, 0.0]), &gallery, 5.0, None).unwrap();
        assert!(at.is_match());
        assert_eq!(at.distance(), 5.0);

        let just_below = f32::from_bits(5.0f32.to_bits() - 1);
        let over = EuclideanMatcher
            .compare(&probe(&[0.0, 0.0]), &gallery, just_below, None)
            .unwrap();
        assert_eq!(over, Decision::NoMatch { best_distance: 5.0 });
    }

    #[test]
    fn test_empty_gallery() {
        let err = EuclideanMatcher.compare(&probe(&[1.0]), &[], 0.5, None).unwrap_err();
        assert_eq!(err, MatchError::EmptyGallery);
    }

    #[test]
    fn test_expired_deadline_stops_between_comparisons() {
        let gallery = vec![entry("a", &[1.0]), entry("b", &[2.0]), entry("c", &[3.0])];
        let past = Instant::now() - Duration::from_millis(5);
        let err = EuclideanMatcher
            .compare(&probe(&[1.0]), &gallery, 0.5, Some(past))
            .unwrap_err();
        // The first comparison always completes.
        assert_eq!(err, MatchError::DeadlineExceeded { compared: 1 });
    }

    #[test]
    fn test_expired_deadline_single_entry_completes() {
        let gallery = vec![entry("only", &[1.0])];
        let past = Instant::now() - Duration::from_millis(5);
        let decision = EuclideanMatcher
            .compare(&probe(&[1.0]), &gallery, 0.5, Some(past))
            .unwrap();
        assert!(decision.is_match());
    }

    #[test]
    fn test_future_deadline_does_not_interfere() {
        let gallery = vec![entry("a", &[1.0]), entry("b", &[2.0])];
        let later = Instant::now() + Duration::from_secs(60);
        let decision = EuclideanMatcher
            .compare(&probe(&[2.0]), &gallery, 0.5, Some(later))
            .unwrap();
        assert!(matches!(decision, Decision::Match { ref code, .. } if code == "b"));
    }
}
