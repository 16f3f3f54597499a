//! Camera session: scoped acquisition of a single frame-source device.
//!
//! A `CameraSession` holds at most one open device. Dropping the handle
//! closes the device, so release happens on every exit path, including
//! panics and task cancellation.

use crate::types::Frame;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Requested capture parameters.
#[derive(Debug, Clone)]
pub struct CameraConstraints {
    /// Device path or source location (e.g. "/dev/video0").
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after opening for AGC/AE stabilisation.
    pub warmup_frames: usize,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            warmup_frames: 4,
        }
    }
}

/// Supplies frames on demand from an opened device.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    async fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens devices. Implemented by the V4L2 and image-file backends.
pub trait CameraDriver {
    type Device: FrameSource;

    fn open(&self, constraints: &CameraConstraints) -> Result<Self::Device, CameraError>;
}

/// Exclusive owner of an opened device. Closing happens on drop.
pub struct CameraHandle<S> {
    device: S,
    device_path: String,
}

impl<S> CameraHandle<S> {
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl<S: FrameSource> FrameSource for CameraHandle<S> {
    async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.device.next_frame().await
    }
}

impl<S> Drop for CameraHandle<S> {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

/// Owns at most one active camera handle.
pub struct CameraSession<D: CameraDriver> {
    driver: D,
    active: Option<CameraHandle<D::Device>>,
}

impl<D: CameraDriver> CameraSession<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            active: None,
        }
    }

    /// Open the device described by `constraints`.
    ///
    /// Any previously active handle is released before the new device is opened.
    pub fn acquire(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<&mut CameraHandle<D::Device>, CameraError> {
        self.release();

        let device = self.driver.open(constraints).map_err(|e| {
            tracing::warn!(device = %constraints.device, error = %e, "camera acquire failed");
            e
        })?;
        tracing::info!(device = %constraints.device, "camera acquired");

        Ok(self.active.insert(CameraHandle {
            device,
            device_path: constraints.device.clone(),
        }))
    }

    /// Release the active handle, if any. Safe to call repeatedly.
    pub fn release(&mut self) {
        // Dropping the handle closes the device.
        self.active.take();
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn handle_mut(&mut self) -> Option<&mut CameraHandle<D::Device>> {
        self.active.as_mut()
    }

    /// Borrow the session behind a guard that releases the camera on drop
    /// unless [`ReleaseGuard::keep`] is called.
    pub fn guard(&mut self) -> ReleaseGuard<'_, D> {
        ReleaseGuard {
            session: self,
            armed: true,
        }
    }
}

/// Releases the camera when dropped, unless disarmed.
pub struct ReleaseGuard<'a, D: CameraDriver> {
    session: &'a mut CameraSession<D>,
    armed: bool,
}

impl<D: CameraDriver> ReleaseGuard<'_, D> {
    /// Keep the camera acquired past the guard's scope.
    pub fn keep(mut self) {
        self.armed = false;
    }

    pub fn handle_mut(&mut self) -> Option<&mut CameraHandle<D::Device>> {
        self.session.handle_mut()
    }
}

impl<D: CameraDriver> Drop for ReleaseGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.session.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct Counters {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct CountingDevice {
        closed: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingDevice {
        async fn next_frame(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame::from_gray(vec![128; 4], 2, 2, 0))
        }
    }

    impl Drop for CountingDevice {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingDriver {
        counters: Counters,
        fail_with: Option<CameraError>,
    }

    impl CameraDriver for CountingDriver {
        type Device = CountingDevice;

        fn open(&self, _constraints: &CameraConstraints) -> Result<CountingDevice, CameraError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CountingDevice {
                closed: self.counters.closed.clone(),
            })
        }
    }

    fn session(fail_with: Option<CameraError>) -> (CameraSession<CountingDriver>, Counters) {
        let counters = Counters::default();
        let driver = CountingDriver {
            counters: counters.clone(),
            fail_with,
        };
        (CameraSession::new(driver), counters)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut session, counters) = session(None);
        session.acquire(&CameraConstraints::default()).unwrap();
        session.release();
        session.release();
        assert!(!session.is_active());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reacquire_releases_previous() {
        let (mut session, counters) = session(None);
        session.acquire(&CameraConstraints::default()).unwrap();
        session.acquire(&CameraConstraints::default()).unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(session.is_active());
    }

    #[test]
    fn test_drop_session_releases() {
        let (mut session, counters) = session(None);
        session.acquire(&CameraConstraints::default()).unwrap();
        drop(session);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_unless_kept() {
        let (mut session, counters) = session(None);
        session.acquire(&CameraConstraints::default()).unwrap();
        session.guard().keep();
        assert!(session.is_active());

        {
            let _guard = session.guard();
        }
        assert!(!session.is_active());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_error_propagates() {
        let (mut session, _) = session(Some(CameraError::PermissionDenied("/dev/video0".into())));
        let err = session.acquire(&CameraConstraints::default()).err();
        assert_eq!(err, Some(CameraError::PermissionDenied("/dev/video0".into())));
        assert!(!session.is_active());
    }
}
