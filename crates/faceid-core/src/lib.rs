//! faceid-core: guided face capture, embedding aggregation and matching.
//!
//! Drives a multi-pose capture sequence against a camera and a shared
//! embedding capability, reduces the accepted samples to one unit-norm
//! embedding, and ranks login candidates by Euclidean distance.

pub mod aggregator;
pub mod camera;
pub mod matcher;
pub mod model;
pub mod onnx;
pub mod orchestrator;
pub mod sampler;
pub mod types;

pub use aggregator::{aggregate, normalize, AggregateError};
pub use camera::{CameraConstraints, CameraDriver, CameraError, CameraHandle, CameraSession, FrameSource};
pub use matcher::{distance, is_match, rank_by_distance, EuclideanMatcher, Matcher, RankedCandidate, DEFAULT_MATCH_THRESHOLD};
pub use model::{CapabilityHandle, CapabilityLoader, EmbeddingCapability, ModelLifecycleService, ModelLoadError};
pub use onnx::{OnnxCapability, OnnxLoader};
pub use orchestrator::{
    cancel_channel, CancelHandle, CancelSignal, CaptureError, CaptureOutcome, CaptureProgress,
    CaptureSettings, CaptureState, GuidedCaptureOrchestrator,
};
pub use sampler::{FaceSampler, SampleError};
pub use types::{CaptureSample, Detection, FaceEmbedding, Frame, PoseTag};

/// Default directory holding the ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("faceid/models")
}
