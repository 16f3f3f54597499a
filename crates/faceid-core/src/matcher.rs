//! Euclidean distance matching for advisory, client-side ranking.
//!
//! The enrollment/login backend is the authority on match decisions.
//! Results from this module only decide which candidates to submit.

use crate::types::FaceEmbedding;
use std::cmp::Ordering;
use thiserror::Error;

/// Default distance cutoff for a match between unit-norm embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding length mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Euclidean distance between two embeddings of equal length.
pub fn distance(a: &FaceEmbedding, b: &FaceEmbedding) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// `distance(a, b) < threshold`, strictly.
pub fn is_match(a: &FaceEmbedding, b: &FaceEmbedding, threshold: f32) -> Result<bool, MatchError> {
    Ok(distance(a, b)? < threshold)
}

/// A candidate embedding with its distance to the ranking reference.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    /// Position of the candidate in the input list.
    pub index: usize,
    pub embedding: FaceEmbedding,
    pub distance: f32,
}

/// Strategy for comparing embeddings against a threshold.
pub trait Matcher {
    fn distance(&self, a: &FaceEmbedding, b: &FaceEmbedding) -> Result<f32, MatchError>;
    fn threshold(&self) -> f32;

    fn is_match(&self, a: &FaceEmbedding, b: &FaceEmbedding) -> Result<bool, MatchError> {
        Ok(self.distance(a, b)? < self.threshold())
    }
}

/// Euclidean matcher with a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn distance(&self, a: &FaceEmbedding, b: &FaceEmbedding) -> Result<f32, MatchError> {
        distance(a, b)
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Sort candidates by ascending distance to `reference`. Ties keep input order.
pub fn rank_by_distance(
    reference: &FaceEmbedding,
    candidates: &[FaceEmbedding],
) -> Result<Vec<RankedCandidate>, MatchError> {
    let mut ranked = candidates
        .iter()
        .enumerate()
        .map(|(index, embedding)| -> Result<RankedCandidate, MatchError> {
            Ok(RankedCandidate {
                index,
                distance: distance(reference, embedding)?,
                embedding: embedding.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ranked.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding::new(values.to_vec())
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = emb(&[0.3, -0.4, 0.866]);
        assert_eq!(distance(&a, &a).unwrap(), 0.0);
        assert!(is_match(&a, &a, 0.001).unwrap());
        assert!(is_match(&a, &a, DEFAULT_MATCH_THRESHOLD).unwrap());
    }

    #[test]
    fn test_distance_symmetric() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[-1.0, 0.5, 2.0]);
        assert_eq!(distance(&a, &b).unwrap(), distance(&b, &a).unwrap());
    }

    #[test]
    fn test_distance_value() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((distance(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[0.5, 0.0]);
        assert!(!is_match(&a, &b, 0.5).unwrap());
        assert!(is_match(&a, &b, 0.5001).unwrap());
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = distance(&emb(&[1.0]), &emb(&[1.0, 0.0])).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { left: 1, right: 2 });
    }

    #[test]
    fn test_euclidean_matcher_default_threshold() {
        let matcher = EuclideanMatcher::default();
        assert_eq!(matcher.threshold(), 0.6);
        assert!(matcher.is_match(&emb(&[1.0, 0.0]), &emb(&[0.9, 0.1])).unwrap());
        assert!(!matcher.is_match(&emb(&[1.0, 0.0]), &emb(&[0.0, 1.0])).unwrap());
    }

    #[test]
    fn test_rank_by_distance_ascending() {
        let reference = emb(&[1.0, 0.0]);
        let candidates = vec![emb(&[0.0, 1.0]), emb(&[1.0, 0.0]), emb(&[0.8, 0.6])];
        let ranked = rank_by_distance(&reference, &candidates).unwrap();
        let order: Vec<usize> = ranked.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(ranked.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
}
