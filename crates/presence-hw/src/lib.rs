//! presence-hw: capture layer for the attendance terminal.
//!
//! Frames, still-image and V4L2 camera sources behind a common
//! open / read / close contract.

pub mod capture;
#[cfg(feature = "v4l2")]
pub mod camera;
pub mod frame;

pub use capture::{
    CaptureError, CaptureSource, CaptureStream, DeviceHandoff, DeviceLease, HandoffToken,
    LeaseGuard, StillImageSource, UnavailableSource,
};
#[cfg(feature = "v4l2")]
pub use camera::Camera;
pub use frame::{Frame, FrameError, PixelFormat};
