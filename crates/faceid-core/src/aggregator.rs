//! Reduces accepted capture samples into one canonical embedding.
//!
//! Mean across samples (equal weights, pose and confidence ignored),
//! followed by L2 normalization.

use crate::types::{CaptureSample, FaceEmbedding};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("cannot aggregate an empty sample set")]
    EmptyInput,
    #[error("embedding length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Aggregate accepted samples into a unit-norm embedding.
///
/// If the mean vector is exactly zero it is returned unnormalized.
pub fn aggregate(samples: &[CaptureSample]) -> Result<FaceEmbedding, AggregateError> {
    let first = samples.first().ok_or(AggregateError::EmptyInput)?;
    let dim = first.embedding().len();

    if samples.len() == 1 {
        return Ok(normalize(first.embedding()));
    }

    // Accumulate in f64 so the mean does not depend on sample order
    // beyond rounding of the final cast.
    let mut sums = vec![0.0f64; dim];
    for sample in samples {
        let values = sample.embedding().as_slice();
        if values.len() != dim {
            return Err(AggregateError::DimensionMismatch {
                expected: dim,
                actual: values.len(),
            });
        }
        for (acc, v) in sums.iter_mut().zip(values) {
            *acc += *v as f64;
        }
    }

    let count = samples.len() as f64;
    let mean: Vec<f64> = sums.into_iter().map(|s| s / count).collect();
    let embedding = normalize_f64(&mean);

    tracing::debug!(samples = samples.len(), dim, "aggregated embedding");
    Ok(embedding)
}

/// L2-normalize an embedding. The zero vector is returned unchanged.
pub fn normalize(embedding: &FaceEmbedding) -> FaceEmbedding {
    let values: Vec<f64> = embedding.values.iter().map(|&v| v as f64).collect();
    normalize_f64(&values)
}

fn normalize_f64(values: &[f64]) -> FaceEmbedding {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    let values = if norm > 0.0 {
        values.iter().map(|v| (v / norm) as f32).collect()
    } else {
        values.iter().map(|&v| v as f32).collect()
    };
    FaceEmbedding::new(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoseTag;

    fn sample(values: &[f32]) -> CaptureSample {
        CaptureSample::new(FaceEmbedding::new(values.to_vec()), 0.9, PoseTag::Center)
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(aggregate(&[]), Err(AggregateError::EmptyInput));
    }

    #[test]
    fn test_single_sample_is_normalized() {
        let out = aggregate(&[sample(&[3.0, 4.0])]).unwrap();
        assert_eq!(out, normalize(&FaceEmbedding::new(vec![3.0, 4.0])));
        assert!((out.values[0] - 0.6).abs() < 1e-6);
        assert!((out.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_mean_then_normalize() {
        let out = aggregate(&[sample(&[1.0, 0.0]), sample(&[0.0, 1.0])]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((out.values[0] - expected).abs() < 1e-6);
        assert!((out.values[1] - expected).abs() < 1e-6);
        assert!((out.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_unit_norm_for_varied_inputs() {
        let samples = vec![
            sample(&[0.3, -1.2, 4.0, 0.01]),
            sample(&[2.5, 0.7, -0.4, 1.0]),
            sample(&[-0.9, 0.2, 0.2, 3.3]),
        ];
        let out = aggregate(&samples).unwrap();
        assert_eq!(out.len(), 4);
        assert!((out.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_mean_is_returned_unnormalized() {
        let out = aggregate(&[sample(&[1.0, -2.0]), sample(&[-1.0, 2.0])]).unwrap();
        assert_eq!(out.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_permutation_invariance() {
        let a = sample(&[0.12, 0.5, -0.33]);
        let b = sample(&[1.4, -0.2, 0.9]);
        let c = sample(&[-0.7, 0.05, 0.61]);
        let forward = aggregate(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let reversed = aggregate(&[c.clone(), b.clone(), a.clone()]).unwrap();
        let shuffled = aggregate(&[b, a, c]).unwrap();
        for i in 0..3 {
            assert!((forward.values[i] - reversed.values[i]).abs() < 1e-6);
            assert!((forward.values[i] - shuffled.values[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = aggregate(&[sample(&[1.0, 0.0]), sample(&[1.0])]).unwrap_err();
        assert_eq!(
            err,
            AggregateError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }
}
