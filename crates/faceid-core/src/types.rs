use serde::{Deserialize, Serialize};

/// Face embedding vector. Length is fixed by the loaded capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceEmbedding {
    pub values: Vec<f32>,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn zeros(len: usize) -> Self {
        Self { values: vec![0.0; len] }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

impl From<Vec<f32>> for FaceEmbedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Guided head orientation. Traversal order is the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseTag {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl PoseTag {
    /// All poses in capture order.
    pub const ALL: [PoseTag; 5] = [
        PoseTag::Center,
        PoseTag::Left,
        PoseTag::Right,
        PoseTag::Up,
        PoseTag::Down,
    ];

    pub fn index(self) -> usize {
        match self {
            PoseTag::Center => 0,
            PoseTag::Left => 1,
            PoseTag::Right => 2,
            PoseTag::Up => 3,
            PoseTag::Down => 4,
        }
    }

    /// The pose that follows this one, or `None` after `Down`.
    pub fn next(self) -> Option<PoseTag> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Prompt shown to the user while this pose is being captured.
    pub fn instruction(self) -> &'static str {
        match self {
            PoseTag::Center => "Look straight at the camera",
            PoseTag::Left => "Turn your head slightly to the left",
            PoseTag::Right => "Turn your head slightly to the right",
            PoseTag::Up => "Tilt your head slightly up",
            PoseTag::Down => "Tilt your head slightly down",
        }
    }
}

/// One accepted face sample. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CaptureSample {
    embedding: FaceEmbedding,
    confidence: f32,
    pose: PoseTag,
}

impl CaptureSample {
    pub fn new(embedding: FaceEmbedding, confidence: f32, pose: PoseTag) -> Self {
        Self {
            embedding,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            pose,
        }
    }

    pub fn embedding(&self) -> &FaceEmbedding {
        &self.embedding
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn pose(&self) -> PoseTag {
        self.pose
    }

    pub fn into_embedding(self) -> FaceEmbedding {
        self.embedding
    }
}

/// Raw output of the embedding capability for a single frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub embedding: FaceEmbedding,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from grayscale pixels, computing the dark flag.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// histogram bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_order() {
        let mut visited = vec![PoseTag::Center];
        let mut pose = PoseTag::Center;
        while let Some(next) = pose.next() {
            visited.push(next);
            pose = next;
        }
        assert_eq!(visited, PoseTag::ALL.to_vec());
        assert_eq!(PoseTag::Down.next(), None);
    }

    #[test]
    fn test_sample_confidence_clamped() {
        let s = CaptureSample::new(FaceEmbedding::new(vec![1.0]), 1.7, PoseTag::Up);
        assert_eq!(s.confidence(), 1.0);
        assert_eq!(s.pose(), PoseTag::Up);
    }

    #[test]
    fn test_sample_non_finite_confidence_is_zero() {
        let s = CaptureSample::new(FaceEmbedding::new(vec![1.0]), f32::NAN, PoseTag::Left);
        assert_eq!(s.confidence(), 0.0);
        let s = CaptureSample::new(FaceEmbedding::new(vec![1.0]), f32::INFINITY, PoseTag::Left);
        assert_eq!(s.confidence(), 0.0);
    }

    #[test]
    fn test_embedding_norm() {
        let e = FaceEmbedding::new(vec![3.0, 4.0]);
        assert!((e.norm() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = FaceEmbedding::new(vec![0.5, -0.25]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.5,-0.25]");
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → not dark
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_frame_from_gray_sets_dark_flag() {
        let frame = Frame::from_gray(vec![200u8; 16], 4, 4, 7);
        assert!(!frame.is_dark);
        assert!((frame.avg_brightness() - 200.0).abs() < 1e-6);
        assert!(Frame::from_gray(vec![0u8; 16], 4, 4, 8).is_dark);
    }
}
