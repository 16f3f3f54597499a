//! Image-directory frame source.
//!
//! Treats a directory of still images as a camera: frames are served in
//! file-name order and the sequence wraps around. Used for offline
//! enrollment and for exercising the pipeline without hardware.

use faceid_core::{CameraConstraints, CameraDriver, CameraError, Frame, FrameSource};
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

/// Opens a directory named by `CameraConstraints::device`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StillsDriver;

impl CameraDriver for StillsDriver {
    type Device = StillsSource;

    fn open(&self, constraints: &CameraConstraints) -> Result<StillsSource, CameraError> {
        StillsSource::open(Path::new(&constraints.device))
    }
}

pub struct StillsSource {
    files: Vec<PathBuf>,
    next: usize,
    sequence: u32,
}

impl StillsSource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir).map_err(|e| dir_error(dir, &e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CameraError::DeviceNotFound(format!(
                "{}: no images found",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), images = files.len(), "opened still-image source");
        Ok(Self {
            files,
            next: 0,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn read_current(&self) -> Result<Frame, CameraError> {
        let path = &self.files[self.next];
        let gray = image::open(path)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (width, height) = gray.dimensions();
        Ok(Frame::from_gray(gray.into_raw(), width, height, self.sequence))
    }
}

impl FrameSource for StillsSource {
    async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let frame = self.read_current()?;
        self.next = (self.next + 1) % self.files.len();
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn dir_error(dir: &Path, e: &io::Error) -> CameraError {
    let shown = dir.display().to_string();
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(shown),
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(shown),
        _ => CameraError::CaptureFailed(format!("{shown}: {e}")),
    }
}
