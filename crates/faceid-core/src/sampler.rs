//! Turns one frame into zero-or-one accepted capture sample.

use crate::camera::{CameraError, FrameSource};
use crate::model::{CapabilityError, CapabilityHandle};
use crate::types::{CaptureSample, PoseTag};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face confidence {0:.3} below minimum")]
    LowConfidence(f32),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
}

impl SampleError {
    /// Per-attempt failures that the orchestrator skips over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SampleError::NoFaceDetected | SampleError::LowConfidence(_))
    }
}

/// Samples faces from a frame source through the shared capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceSampler;

impl FaceSampler {
    /// Grab the current frame and run the capability on it.
    ///
    /// Confidence below `min_confidence` is a failure, never a degraded
    /// success. Dark frames are rejected before inference.
    pub async fn sample<S: FrameSource>(
        &self,
        source: &mut S,
        capability: &CapabilityHandle,
        min_confidence: f32,
        pose: PoseTag,
    ) -> Result<CaptureSample, SampleError> {
        let frame = source.next_frame().await?;

        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            return Err(SampleError::NoFaceDetected);
        }

        let detection = capability
            .detect(&frame)?
            .ok_or(SampleError::NoFaceDetected)?;

        let expected = capability.dimension();
        if detection.embedding.len() != expected {
            return Err(CapabilityError::DimensionMismatch {
                expected,
                actual: detection.embedding.len(),
            }
            .into());
        }

        // NaN compares false against the floor; treat it as no confidence at all.
        if !detection.confidence.is_finite() || detection.confidence < min_confidence {
            tracing::debug!(
                seq = frame.sequence,
                confidence = detection.confidence,
                min_confidence,
                "face below confidence floor"
            );
            return Err(SampleError::LowConfidence(detection.confidence));
        }

        Ok(CaptureSample::new(detection.embedding, detection.confidence, pose))
    }
}
