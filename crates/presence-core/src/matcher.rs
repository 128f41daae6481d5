//! Nearest-descriptor matching under a distance threshold.

use crate::types::{Descriptor, GalleryEntry, Identity, MatchResult, Threshold};

/// Strategy for comparing a query descriptor against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Descriptor, gallery: &[GalleryEntry]) -> MatchResult;

    fn threshold(&self) -> Threshold;
}

/// Euclidean nearest-neighbour matcher with a threshold fixed at construction.
///
/// Always scans every gallery entry; there is no early exit, since any entry
/// could hold the minimum. Entries with a different dimension than the query
/// are not candidates. Equal minimal distances resolve to the
/// lexicographically lowest identity, so the outcome does not depend on the
/// order the store returned entries in.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    threshold: Threshold,
}

impl EuclideanMatcher {
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Descriptor, gallery: &[GalleryEntry]) -> MatchResult {
        let mut best: Option<(f32, &Identity)> = None;
        let mut skipped = 0usize;

        for entry in gallery {
            let Some(distance) = query.distance(&entry.descriptor) else {
                skipped += 1;
                continue;
            };
            let better = match best {
                None => true,
                Some((best_distance, best_identity)) => {
                    distance < best_distance
                        || (distance == best_distance && entry.identity < *best_identity)
                }
            };
            if better {
                best = Some((distance, &entry.identity));
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                query_dim = query.len(),
                "gallery entries with mismatched dimension ignored"
            );
        }

        match best {
            Some((distance, identity)) if self.threshold.accepts(distance) => {
                MatchResult::Matched {
                    identity: identity.clone(),
                    distance,
                }
            }
            Some((distance, _)) => MatchResult::NoMatch {
                best_distance: distance,
            },
            None => MatchResult::NoMatch {
                best_distance: f32::INFINITY,
            },
        }
    }

    fn threshold(&self) -> Threshold {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    fn entry(identity: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry::new(Identity::new(identity).unwrap(), desc(values))
    }

    fn matcher(threshold: f32) -> EuclideanMatcher {
        EuclideanMatcher::new(Threshold::new(threshold).unwrap())
    }

    #[test]
    fn test_exact_query_matches_at_zero() {
        let va = [0.1, 0.2, 0.3, 0.4];
        let gallery = vec![entry("E1", &va)];
        let result = matcher(0.6).compare(&desc(&va), &gallery);
        assert_eq!(
            result,
            MatchResult::Matched {
                identity: Identity::new("E1").unwrap(),
                distance: 0.0
            }
        );
    }

    #[test]
    fn test_exact_query_matches_for_any_positive_threshold() {
        let va = [0.3, -0.7];
        let gallery = vec![entry("E1", &va), entry("E2", &[5.0, 5.0])];
        for threshold in [1e-6, 0.01, 0.6, 10.0] {
            let result = matcher(threshold).compare(&desc(&va), &gallery);
            assert_eq!(result.identity().map(Identity::as_str), Some("E1"));
        }
    }

    #[test]
    fn test_far_query_is_no_match_with_distance() {
        let gallery = vec![entry("E1", &[0.0, 0.0])];
        let result = matcher(0.6).compare(&desc(&[0.8, 0.0]), &gallery);
        match result {
            MatchResult::NoMatch { best_distance } => assert!((best_distance - 0.8).abs() < 1e-6),
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[test]
    fn test_global_minimum_wins_over_first_listed() {
        // query sits 0.5 from vA and 0.3 from vB
        let gallery = vec![entry("E1", &[0.0, 0.0]), entry("E2", &[0.8, 0.0])];
        let result = matcher(0.6).compare(&desc(&[0.5, 0.0]), &gallery);
        match result {
            MatchResult::Matched { identity, distance } => {
                assert_eq!(identity.as_str(), "E2");
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_gallery_is_no_match_infinity() {
        let result = matcher(0.6).compare(&desc(&[1.0]), &[]);
        assert_eq!(
            result,
            MatchResult::NoMatch {
                best_distance: f32::INFINITY
            }
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        let gallery = vec![entry("E1", &[0.0])];
        let result = matcher(0.5).compare(&desc(&[0.5]), &gallery);
        assert!(!result.is_match());
    }

    #[test]
    fn test_threshold_monotonicity() {
        let gallery = vec![
            entry("E1", &[0.0, 0.0]),
            entry("E2", &[1.0, 1.0]),
            entry("E3", &[-0.4, 0.9]),
        ];
        let queries = [[0.3, 0.2], [0.9, 0.6], [2.0, -2.0], [-0.4, 0.5]];
        let thresholds = [0.05, 0.2, 0.4, 0.6, 0.9, 1.5, 4.0];

        for query in queries {
            let query = desc(&query);
            let mut seen_match: Option<Identity> = None;
            for t in thresholds {
                let result = matcher(t).compare(&query, &gallery);
                if let Some(prev) = &seen_match {
                    // once matched, a larger threshold keeps the same match
                    assert_eq!(result.identity(), Some(prev), "threshold {t}");
                } else if let Some(identity) = result.identity() {
                    seen_match = Some(identity.clone());
                }
            }
        }
    }

    #[test]
    fn test_multiple_descriptors_per_identity_are_independent() {
        let gallery = vec![
            entry("E1", &[5.0, 5.0]),
            entry("E2", &[0.0, 0.4]),
            entry("E1", &[0.0, 0.1]),
        ];
        let result = matcher(0.6).compare(&desc(&[0.0, 0.0]), &gallery);
        assert_eq!(result.identity().map(Identity::as_str), Some("E1"));
        assert!((result.distance().unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_tie_resolves_to_lowest_identity() {
        let forward = vec![entry("E9", &[1.0, 0.0]), entry("E3", &[-1.0, 0.0])];
        let backward: Vec<_> = forward.iter().rev().cloned().collect();
        let query = desc(&[0.0, 0.0]);

        for gallery in [forward, backward] {
            let result = matcher(2.0).compare(&query, &gallery);
            assert_eq!(result.identity().map(Identity::as_str), Some("E3"));
        }
    }

    #[test]
    fn test_dimension_mismatch_entries_skipped() {
        let gallery = vec![entry("E1", &[0.0, 0.0, 0.0]), entry("E2", &[0.2, 0.0])];
        let result = matcher(0.6).compare(&desc(&[0.0, 0.0]), &gallery);
        assert_eq!(result.identity().map(Identity::as_str), Some("E2"));

        let only_mismatched = vec![entry("E1", &[0.0, 0.0, 0.0])];
        let result = matcher(0.6).compare(&desc(&[0.0, 0.0]), &only_mismatched);
        assert_eq!(
            result,
            MatchResult::NoMatch {
                best_distance: f32::INFINITY
            }
        );
    }

    #[test]
    fn test_all_entries_scanned_best_is_last() {
        let gallery = vec![
            entry("decoy1", &[0.0, 1.0, 0.0]),
            entry("decoy2", &[0.0, 0.0, 1.0]),
            entry("match", &[1.0, 0.0, 0.0]),
        ];
        let result = matcher(0.6).compare(&desc(&[1.0, 0.0, 0.0]), &gallery);
        assert_eq!(result.identity().map(Identity::as_str), Some("match"));
    }
}
