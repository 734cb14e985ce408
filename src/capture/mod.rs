pub mod backend;
pub mod camera;
pub mod decoder;
pub mod frame;
pub mod mjpeg;
pub mod pool;
pub mod synthetic;
pub mod transform;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use backend::{CaptureBackend, Negotiated, Property, ReadOutcome};
pub use camera::{Camera, CameraConfig, Resolution, SourceKind, Tuning};
pub use frame::{Frame, FrameInfo, PixelFormat};
pub use pool::{FramePool, PoolStats, PooledFrame};
pub use transform::Rotation;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCapture;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;
