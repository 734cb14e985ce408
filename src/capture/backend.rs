//! Capture backends: the things that actually produce pixels.

use tracing::debug;

use crate::capture::camera::SourceKind;
use crate::capture::mjpeg::MjpegFile;
use crate::capture::synthetic::SyntheticSource;
use crate::error::{Error, Result};

/// What a backend returned from a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer holds a packed RGB24 image of this size
    Frame { width: u32, height: u32 },
    /// No more frames; expected for files, terminal for everything else
    EndOfStream,
}

/// Values the backend settled on after opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Capture tuning properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    AutoExposure,
    Brightness,
    Contrast,
    Saturation,
    Gain,
    Exposure,
    Sharpness,
}

/// Parameters requested when opening a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A source of raw frames
pub trait CaptureBackend: Send {
    fn negotiated(&self) -> Negotiated;

    /// Fill `buf` with the next frame. Blocks as long as the device does.
    fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome>;

    fn set(&mut self, property: Property, value: f64) -> Result<()>;

    fn close(&mut self) {}
}

/// Bind a source descriptor to the backend able to serve it
pub fn open_backend(kind: &SourceKind, params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    if let Some(descriptor) = kind.stub_descriptor() {
        debug!(descriptor, "Opening synthetic source");
        return Ok(Box::new(SyntheticSource::open(descriptor, params)?));
    }

    match kind {
        SourceKind::File(path) => Ok(Box::new(MjpegFile::open(path, params)?)),
        SourceKind::DeviceIndex(idx) => open_device_index(*idx, params),
        SourceKind::DeviceName(name) => open_device_name(name, params),
        SourceKind::Address(address) => open_address(address, params),
    }
}

#[cfg(feature = "v4l2")]
fn open_device_index(idx: u32, params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    let path = format!("/dev/video{idx}");
    Ok(Box::new(crate::capture::v4l2::V4l2Capture::open(&path, params)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_device_index(idx: u32, _params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    Err(Error::unavailable(
        format!("device {idx}"),
        "built without the v4l2 feature",
    ))
}

#[cfg(feature = "v4l2")]
fn open_device_name(name: &str, params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(crate::capture::v4l2::V4l2Capture::open(name, params)?))
}

#[cfg(all(feature = "gstreamer-pipeline", not(feature = "v4l2")))]
fn open_device_name(name: &str, params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    use crate::capture::gst_capture::{device_pipeline, GstCapture};
    Ok(Box::new(GstCapture::open(name, &device_pipeline(name, params))?))
}

#[cfg(not(any(feature = "v4l2", feature = "gstreamer-pipeline")))]
fn open_device_name(name: &str, _params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    Err(Error::unavailable(
        name,
        "built without the v4l2 or gstreamer-pipeline features",
    ))
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_address(address: &str, params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    use crate::capture::gst_capture::{network_pipeline, GstCapture};
    Ok(Box::new(GstCapture::open(address, &network_pipeline(address, params))?))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_address(address: &str, _params: &OpenParams) -> Result<Box<dyn CaptureBackend>> {
    Err(Error::unavailable(
        address,
        "built without the gstreamer-pipeline feature",
    ))
}
