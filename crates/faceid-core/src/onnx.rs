//! ONNX Runtime embedding capability: SCRFD detection + ArcFace recognition.
//!
//! Only the single highest-scoring SCRFD anchor is decoded, since capture
//! needs zero-or-one face per frame. The face box is squared, cropped and
//! resized to the ArcFace input; the descriptor is L2-normalized.

use crate::model::{CapabilityError, CapabilityHandle, CapabilityLoader, EmbeddingCapability, ModelLoadError};
use crate::types::{Detection, FaceEmbedding, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Positional output layout: (score, bbox) per stride.
const SCRFD_OUTPUTS: [(usize, usize); 3] = [(0, 3), (1, 4), (2, 5)];
/// Anchors scoring below this are not treated as faces at all.
const SCRFD_DETECTION_FLOOR: f32 = 0.3;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";

/// Face box in original frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

pub struct OnnxCapability {
    detector: Mutex<Session>,
    recognizer: Mutex<Session>,
}

impl OnnxCapability {
    /// Load both models. Blocking; call from a blocking context.
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, ModelLoadError> {
        let detector = open_session(detector_path)?;
        let recognizer = open_session(recognizer_path)?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }

    fn locate_face(&self, frame: &Frame) -> Result<Option<FaceBox>, CapabilityError> {
        let (input, scale, pad_x, pad_y) =
            letterbox_tensor(&frame.data, frame.width as usize, frame.height as usize);

        let mut session = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![TensorRef::from_array_view(input.view()).map_err(inference)?])
            .map_err(inference)?;

        let mut best: Option<FaceBox> = None;
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(SCRFD_OUTPUTS.iter()) {
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(inference)?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(inference)?;

            let Some((idx, score)) = best_anchor(scores) else {
                continue;
            };
            if score <= SCRFD_DETECTION_FLOOR || best.is_some_and(|b| b.score >= score) {
                continue;
            }
            if let Some(face) = decode_anchor(bboxes, idx, stride, score) {
                best = Some(FaceBox {
                    x1: (face.x1 - pad_x) / scale,
                    y1: (face.y1 - pad_y) / scale,
                    x2: (face.x2 - pad_x) / scale,
                    y2: (face.y2 - pad_y) / scale,
                    score,
                });
            }
        }
        Ok(best)
    }

    fn embed(&self, frame: &Frame, face: &FaceBox) -> Result<FaceEmbedding, CapabilityError> {
        let crop = square_crop(frame, face, ARCFACE_INPUT_SIZE);
        let input = arcface_tensor(&crop);

        let mut session = self.recognizer.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![TensorRef::from_array_view(input.view()).map_err(inference)?])
            .map_err(inference)?;
        let (_, raw) = outputs[0].try_extract_tensor::<f32>().map_err(inference)?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(CapabilityError::DimensionMismatch {
                expected: ARCFACE_EMBEDDING_DIM,
                actual: raw.len(),
            });
        }

        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };
        Ok(FaceEmbedding::new(values))
    }
}

impl EmbeddingCapability for OnnxCapability {
    fn detect(&self, frame: &Frame) -> Result<Option<Detection>, CapabilityError> {
        let Some(face) = self.locate_face(frame)? else {
            return Ok(None);
        };
        let embedding = self.embed(frame, &face)?;
        Ok(Some(Detection {
            embedding,
            confidence: face.score.clamp(0.0, 1.0),
        }))
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn name(&self) -> &str {
        "scrfd+arcface"
    }
}

/// Loads [`OnnxCapability`] on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
}

impl OnnxLoader {
    pub fn from_model_dir(dir: &Path) -> Self {
        Self {
            detector_path: dir.join(DETECTOR_FILE),
            recognizer_path: dir.join(RECOGNIZER_FILE),
        }
    }
}

impl CapabilityLoader for OnnxLoader {
    async fn load(&self) -> Result<CapabilityHandle, ModelLoadError> {
        let detector = self.detector_path.clone();
        let recognizer = self.recognizer_path.clone();
        let capability = tokio::task::spawn_blocking(move || OnnxCapability::load(&detector, &recognizer))
            .await
            .map_err(|e| ModelLoadError::Failed(format!("loader task: {e}")))??;
        Ok(CapabilityHandle::new(capability))
    }
}

fn open_session(path: &Path) -> Result<Session, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::NotFound(path.display().to_string()));
    }
    let session = Session::builder()
        .map_err(|e| load_failed(path, e))?
        .with_intra_threads(2)
        .map_err(|e| load_failed(path, e))?
        .commit_from_file(path)
        .map_err(|e| load_failed(path, e))?;

    tracing::info!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

fn load_failed<E: std::fmt::Display>(path: &Path, e: E) -> ModelLoadError {
    ModelLoadError::Failed(format!("{}: {e}", path.display()))
}

fn inference<E: std::fmt::Display>(e: E) -> CapabilityError {
    CapabilityError::InferenceFailed(e.to_string())
}

fn best_anchor(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
}

/// Decode one anchor's distance-to-edge box into letterboxed input coordinates.
fn decode_anchor(bboxes: &[f32], idx: usize, stride: usize, score: f32) -> Option<FaceBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let cell = idx / SCRFD_ANCHORS_PER_CELL;
    let cx = ((cell % grid_w) * stride) as f32;
    let cy = ((cell / grid_w) * stride) as f32;
    let off = idx * 4;
    let d = bboxes.get(off..off + 4)?;
    let s = stride as f32;
    Some(FaceBox {
        x1: cx - d[0] * s,
        y1: cy - d[1] * s,
        x2: cx + d[2] * s,
        y2: cy + d[3] * s,
        score,
    })
}

/// Letterbox a grayscale frame into the SCRFD NCHW tensor.
/// Returns the tensor with the scale and padding used.
fn letterbox_tensor(gray: &[u8], width: usize, height: usize) -> (Array4<f32>, f32, f32, f32) {
    let size = SCRFD_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    if width == 0 || height == 0 || gray.len() < width * height {
        return (tensor, 1.0, 0.0, 0.0);
    }

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = ((size - new_w) / 2) as f32;
    let pad_y = ((size - new_h) / 2) as f32;

    // Padding stays at 0.0, which is what SCRFD_MEAN normalizes to.
    let resized = resize_bilinear(gray, width, height, new_w, new_h);
    let (px, py) = (pad_x as usize, pad_y as usize);
    for y in 0..new_h {
        for x in 0..new_w {
            let v = (resized[y * new_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y + py, x + px]] = v;
            }
        }
    }
    (tensor, scale, pad_x, pad_y)
}

/// Crop a square around the face box (clamped to the frame) and resize to `out`.
fn square_crop(frame: &Frame, face: &FaceBox, out: usize) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w == 0 || h == 0 || frame.data.len() < w * h {
        return vec![0; out * out];
    }

    let side = (face.x2 - face.x1).max(face.y2 - face.y1).max(1.0);
    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;
    let x0 = ((cx - side / 2.0).max(0.0) as usize).min(w - 1);
    let y0 = ((cy - side / 2.0).max(0.0) as usize).min(h - 1);
    let cw = (side as usize).clamp(1, w - x0);
    let ch = (side as usize).clamp(1, h - y0);

    let mut crop = Vec::with_capacity(cw * ch);
    for row in frame.data[y0 * w..].chunks(w).take(ch) {
        crop.extend_from_slice(&row[x0..x0 + cw]);
    }
    resize_bilinear(&crop, cw, ch, out, out)
}

fn arcface_tensor(face: &[u8]) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = face.get(y * size + x).copied().unwrap_or(0) as f32;
            let v = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

fn resize_bilinear(src: &[u8], w: usize, h: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; new_w * new_h];
    let sx = w as f32 / new_w as f32;
    let sy = h as f32 / new_h as f32;

    for y in 0..new_h {
        let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let dy = fy - y0 as f32;
        for x in 0..new_w {
            let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let dx = fx - x0 as f32;

            let top = src[y0 * w + x0] as f32 * (1.0 - dx) + src[y0 * w + x1] as f32 * dx;
            let bot = src[y1 * w + x0] as f32 * (1.0 - dx) + src[y1 * w + x1] as f32 * dx;
            out[y * new_w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
