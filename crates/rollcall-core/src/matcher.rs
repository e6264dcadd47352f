//! Batch nearest-neighbour recognition over a reference set.
//!
//! Every query is compared against every reference embedding by L2 distance.
//! The nearest reference wins if it is strictly closer than the threshold;
//! equidistant references resolve to the lowest index.

use crate::types::{Embedding, Recognition, ReferenceSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("match threshold must be finite and positive, got {0}")]
    InvalidThreshold(f32),
    #[error("query {index} has dimension {actual}, reference set has {expected}")]
    DimensionMismatch { index: usize, expected: usize, actual: usize },
}

/// Nearest reference entry for one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub index: usize,
    pub distance: f32,
}

/// Strategy for finding the nearest reference embedding to a query.
///
/// Implementations must return the global minimum distance with ties
/// resolved to the lowest reference index.
pub trait Matcher {
    fn nearest(&self, query: &Embedding, reference: &ReferenceSet) -> Option<Nearest>;
}

/// Brute-force linear scan. O(M × D) per query.
pub struct L2Matcher;

impl Matcher for L2Matcher {
    fn nearest(&self, query: &Embedding, reference: &ReferenceSet) -> Option<Nearest> {
        let mut best: Option<Nearest> = None;

        for (index, candidate) in reference.embeddings().iter().enumerate() {
            let distance = query.euclidean_distance(candidate);
            // Strict `<` keeps the first of several equal minima.
            let closer = match best {
                None => !distance.is_nan(),
                Some(b) => distance < b.distance,
            };
            if closer {
                best = Some(Nearest { index, distance });
            }
        }

        best
    }
}

/// Recognize every query against `reference` with the default [`L2Matcher`].
pub fn recognize_batch(
    queries: &[Embedding],
    reference: &ReferenceSet,
    threshold: f32,
) -> Result<Vec<Recognition>, MatchError> {
    recognize_batch_with(&L2Matcher, queries, reference, threshold)
}

/// Recognize every query against `reference`.
///
/// Output `i` corresponds to `queries[i]`. An empty reference set yields
/// `Unknown` for every query.
pub fn recognize_batch_with<M: Matcher + ?Sized>(
    matcher: &M,
    queries: &[Embedding],
    reference: &ReferenceSet,
    threshold: f32,
) -> Result<Vec<Recognition>, MatchError> {
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(MatchError::InvalidThreshold(threshold));
    }

    if let Some(expected) = reference.dimension() {
        if let Some((index, query)) = queries
            .iter()
            .enumerate()
            .find(|(_, q)| q.dimension() != expected)
        {
            return Err(MatchError::DimensionMismatch {
                index,
                expected,
                actual: query.dimension(),
            });
        }
    }

    let results = queries
        .iter()
        .map(|query| match matcher.nearest(query, reference) {
            Some(n) if n.distance < threshold => Recognition::Known {
                identity: reference.identities()[n.index].clone(),
                distance: n.distance,
            },
            Some(n) => Recognition::Unknown { nearest: Some(n.distance) },
            None => Recognition::Unknown { nearest: None },
        })
        .collect();

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, UNKNOWN_LABEL};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn reference(entries: &[(&[f32], &str)]) -> ReferenceSet {
        let mut set = ReferenceSet::new();
        for (values, label) in entries {
            set.push(emb(values), Identity::new(*label).unwrap()).unwrap();
        }
        set
    }

    fn labels(results: &[Recognition]) -> Vec<&str> {
        results.iter().map(Recognition::label).collect()
    }

    #[test]
    fn test_identical_vector_is_recognized() {
        let v = [0.1, 0.2, 0.3, 0.4];
        let set = reference(&[(&v, "101")]);
        let results = recognize_batch(&[emb(&v)], &set, 0.92).unwrap();
        assert_eq!(labels(&results), vec!["101"]);
        assert_eq!(results[0].distance(), Some(0.0));
    }

    #[test]
    fn test_empty_reference_returns_unknown() {
        let set = ReferenceSet::new();
        let results = recognize_batch(&[emb(&[1.0, 2.0]), emb(&[3.0])], &set, 0.92).unwrap();
        assert_eq!(labels(&results), vec![UNKNOWN_LABEL, UNKNOWN_LABEL]);
        assert!(results.iter().all(|r| r.distance().is_none()));
    }

    #[test]
    fn test_one_match_one_unknown() {
        // Nearest distances: 0.3 for the first query, 1.5 for the second.
        let set = reference(&[(&[0.0, 0.0], "101"), (&[10.0, 10.0], "102")]);
        let queries = [emb(&[0.3, 0.0]), emb(&[0.0, 1.5])];
        let results = recognize_batch(&queries, &set, 0.92).unwrap();
        assert_eq!(labels(&results), vec!["101", UNKNOWN_LABEL]);
        assert!((results[1].distance().unwrap() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        let set = reference(&[(&[0.0, 0.0], "101")]);
        let query = emb(&[3.0, 4.0]);

        let at = recognize_batch(std::slice::from_ref(&query), &set, 5.0).unwrap();
        assert_eq!(at[0], Recognition::Unknown { nearest: Some(5.0) });

        let below = recognize_batch(std::slice::from_ref(&query), &set, 5.0 + 1e-4).unwrap();
        assert_eq!(labels(&below), vec!["101"]);
    }

    #[test]
    fn test_output_order_follows_queries() {
        let set = reference(&[
            (&[0.0, 0.0, 1.0], "c"),
            (&[1.0, 0.0, 0.0], "a"),
            (&[0.0, 1.0, 0.0], "b"),
        ]);
        let queries = [emb(&[1.0, 0.0, 0.0]), emb(&[0.0, 1.0, 0.0]), emb(&[0.0, 0.0, 1.0])];
        let results = recognize_batch(&queries, &set, 0.5).unwrap();
        assert_eq!(labels(&results), vec!["a", "b", "c"]);

        let reversed: Vec<Embedding> = queries.iter().rev().cloned().collect();
        let results = recognize_batch(&reversed, &set, 0.5).unwrap();
        assert_eq!(labels(&results), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_tie_resolves_to_lowest_index() {
        let set = reference(&[(&[1.0, 0.0], "first"), (&[-1.0, 0.0], "second")]);
        let results = recognize_batch(&[emb(&[0.0, 0.0])], &set, 2.0).unwrap();
        assert_eq!(labels(&results), vec!["first"]);
    }

    #[test]
    fn test_global_minimum_not_first_below_threshold() {
        // The first reference is within the threshold but the later one is closer.
        let set = reference(&[(&[0.5, 0.0], "near"), (&[0.1, 0.0], "nearest")]);
        let results = recognize_batch(&[emb(&[0.0, 0.0])], &set, 0.92).unwrap();
        assert_eq!(labels(&results), vec!["nearest"]);
    }

    #[test]
    fn test_deterministic() {
        let set = reference(&[(&[0.2, 0.9], "101"), (&[0.8, 0.1], "102"), (&[0.5, 0.5], "103")]);
        let queries = [emb(&[0.3, 0.8]), emb(&[0.9, 0.9]), emb(&[0.7, 0.2])];
        let first = recognize_batch(&queries, &set, 0.3).unwrap();
        for _ in 0..10 {
            assert_eq!(recognize_batch(&queries, &set, 0.3).unwrap(), first);
        }
    }

    #[test]
    fn test_invalid_threshold() {
        let set = ReferenceSet::new();
        for t in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                recognize_batch(&[], &set, t),
                Err(MatchError::InvalidThreshold(_))
            ));
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let set = reference(&[(&[0.0, 0.0], "101")]);
        let err = recognize_batch(&[emb(&[0.0, 0.0]), emb(&[0.0])], &set, 1.0).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { index: 1, expected: 2, actual: 1 });
    }

    #[test]
    fn test_matcher_scans_every_entry() {
        // Best match is the last entry.
        let set = reference(&[(&[0.0, 1.0], "decoy1"), (&[0.0, -1.0], "decoy2"), (&[1.0, 0.0], "match")]);
        let nearest = L2Matcher.nearest(&emb(&[1.0, 0.0]), &set).unwrap();
        assert_eq!(nearest.index, 2);
        assert_eq!(nearest.distance, 0.0);
        assert_eq!(L2Matcher.nearest(&emb(&[1.0, 0.0]), &ReferenceSet::new()), None);
    }
}
