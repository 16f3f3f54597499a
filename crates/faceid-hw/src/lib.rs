//! faceid-hw: frame sources for guided capture.
//!
//! Provides a V4L2 camera driver and an image-directory driver, both
//! implementing `faceid_core::CameraDriver`.

pub mod camera;
pub mod frame;
pub mod stills;

pub use camera::{Camera, DeviceInfo, V4lDriver};
pub use frame::PixelFormat;
pub use stills::{StillsDriver, StillsSource};
