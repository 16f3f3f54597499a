//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use faceid_core::{CameraConstraints, CameraDriver, CameraError, Frame, FrameSource};
use std::io;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Opened V4L2 capture device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a device and negotiate a grayscale-convertible format.
    pub fn open(constraints: &CameraConstraints) -> Result<Self, CameraError> {
        let device_path = constraints.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceNotFound(format!(
                "{device_path}: not a video capture device"
            )));
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for YUYV; IR cameras commonly negotiate GREY or Y16 instead.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::CaptureFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let camera = Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        };

        if constraints.warmup_frames > 0 {
            tracing::info!(count = constraints.warmup_frames, "discarding warmup frames");
            for _ in 0..constraints.warmup_frames {
                let _ = camera.capture_frame();
            }
        }

        Ok(camera)
    }

    /// Capture a single frame, converting to grayscale.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = frame::to_grayscale(self.pixel_format, buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "closing V4L2 device");
    }
}

/// Opens V4L2 devices for a `CameraSession`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4lDriver;

impl CameraDriver for V4lDriver {
    type Device = Camera;

    fn open(&self, constraints: &CameraConstraints) -> Result<Camera, CameraError> {
        Camera::open(constraints)
    }
}

/// Map an open(2) failure onto the camera error taxonomy.
fn open_error(device_path: &str, e: &io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(libc::EBUSY) => return CameraError::DeviceBusy(device_path.to_string()),
        Some(libc::EACCES) | Some(libc::EPERM) => {
            return CameraError::PermissionDenied(device_path.to_string())
        }
        _ => {}
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
        _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_busy() {
        let e = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(open_error("/dev/video2", &e), CameraError::DeviceBusy("/dev/video2".into()));
    }

    #[test]
    fn test_open_error_permission() {
        let e = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(
            open_error("/dev/video2", &e),
            CameraError::PermissionDenied("/dev/video2".into())
        );
    }

    #[test]
    fn test_open_error_not_found() {
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(
            open_error("/dev/video9", &e),
            CameraError::DeviceNotFound("/dev/video9".into())
        );
    }

    #[test]
    fn test_open_missing_device() {
        let constraints = CameraConstraints {
            device: "/dev/faceid-no-such-camera".into(),
            ..CameraConstraints::default()
        };
        assert!(matches!(
            Camera::open(&constraints),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
