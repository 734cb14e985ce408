//! A configured video source and its open/read/close lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::backend::{open_backend, CaptureBackend, Negotiated, OpenParams, Property, ReadOutcome};
use crate::capture::frame::{Frame, RGB_CHANNELS};
use crate::capture::synthetic::STUB_SCHEME;
use crate::capture::transform::{rotate, Rotation};
use crate::error::{Error, Result};

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSource", into = "RawSource")]
pub enum SourceKind {
    /// `/dev/video<N>`
    DeviceIndex(u32),
    /// A device node such as `/dev/v4l/by-id/...`
    DeviceName(String),
    /// Network camera URL, or a `stub://` synthetic scene
    Address(String),
    /// Motion JPEG file
    File(PathBuf),
}

/// Camera documents give sources either as a bare index or as a string
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSource {
    Index(u32),
    Text(String),
}

impl From<RawSource> for SourceKind {
    fn from(raw: RawSource) -> Self {
        match raw {
            RawSource::Index(idx) => SourceKind::DeviceIndex(idx),
            RawSource::Text(text) => SourceKind::parse(&text),
        }
    }
}

impl From<SourceKind> for RawSource {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::DeviceIndex(idx) => RawSource::Index(idx),
            other => RawSource::Text(other.to_string()),
        }
    }
}

impl SourceKind {
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if !source.is_empty() && source.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(idx) = source.parse() {
                return SourceKind::DeviceIndex(idx);
            }
        }
        if source.starts_with("/dev/") {
            SourceKind::DeviceName(source.to_string())
        } else if source.contains("://") {
            SourceKind::Address(source.to_string())
        } else {
            SourceKind::File(PathBuf::from(source))
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, SourceKind::File(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, SourceKind::DeviceIndex(_) | SourceKind::DeviceName(_))
    }

    /// The descriptor of a synthetic scene, if this is one
    pub fn stub_descriptor(&self) -> Option<&str> {
        match self {
            SourceKind::Address(address) if address.starts_with(STUB_SCHEME) => Some(address),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::DeviceIndex(idx) => write!(f, "{idx}"),
            SourceKind::DeviceName(name) => f.write_str(name),
            SourceKind::Address(address) => f.write_str(address),
            SourceKind::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Device tuning, applied to physical devices only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Below 0.5 selects manual exposure
    pub auto_exposure: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub gain: f64,
    pub exposure: f64,
    pub sharpness: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            auto_exposure: 0.25,
            brightness: 40.0,
            contrast: 10.0,
            saturation: 80.0,
            gain: 90.0,
            exposure: 155.0,
            sharpness: 0.0,
        }
    }
}

impl Tuning {
    /// Auto exposure goes first so the manual exposure value sticks
    fn properties(&self) -> [(Property, f64); 7] {
        [
            (Property::AutoExposure, self.auto_exposure),
            (Property::Exposure, self.exposure),
            (Property::Brightness, self.brightness),
            (Property::Contrast, self.contrast),
            (Property::Saturation, self.saturation),
            (Property::Gain, self.gain),
            (Property::Sharpness, self.sharpness),
        ]
    }
}

/// Everything needed to open a source
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub kind: SourceKind,
    pub resolution: Resolution,
    pub fps: u32,
    pub rotation: Rotation,
    pub tuning: Tuning,
}

impl CameraConfig {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            resolution: Resolution::new(640, 480),
            fps: 30,
            rotation: Rotation::None,
            tuning: Tuning::default(),
        }
    }
}

/// Source handle
pub struct Camera {
    config: CameraConfig,
    backend: Option<Box<dyn CaptureBackend>>,
    /// Negotiated values after rotation, only set while open
    actual: Option<Negotiated>,
    total_frames: u64,
}

impl Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            backend: None,
            actual: None,
            total_frames: 0,
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.config.kind
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Resolution and fps the backend settled on, rotation applied
    pub fn actual(&self) -> Option<Negotiated> {
        self.actual
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Open the configured source, closing it first if it is already open
    #[instrument(skip(self), fields(source = %self.config.kind))]
    pub fn open(&mut self) -> Result<()> {
        self.close();

        let params = OpenParams {
            width: self.config.resolution.width,
            height: self.config.resolution.height,
            fps: self.config.fps,
        };
        let mut backend = open_backend(&self.config.kind, &params)?;

        if self.config.kind.is_device() {
            for (property, value) in self.config.tuning.properties() {
                if let Err(e) = backend.set(property, value) {
                    warn!(?property, value, "Failed to apply tuning: {}", e);
                }
            }
        }

        let negotiated = backend.negotiated();
        let (width, height) = self
            .config
            .rotation
            .apply_to_size(negotiated.width, negotiated.height);
        let actual = Negotiated {
            width,
            height,
            fps: negotiated.fps,
        };

        info!(
            width = actual.width,
            height = actual.height,
            fps = actual.fps,
            "Source opened"
        );

        self.backend = Some(backend);
        self.actual = Some(actual);
        Ok(())
    }

    /// Reopen a file-backed source on another file
    pub fn open_file(&mut self, path: &Path) -> Result<()> {
        if !self.config.kind.is_file() {
            return Err(Error::NotFileBacked);
        }
        self.config.kind = SourceKind::File(path.to_path_buf());
        self.open()
    }

    /// Read the next frame into `frame`, rotating it as configured.
    ///
    /// Only pixels and dimensions are written; ids are left to the caller.
    pub fn read(&mut self, frame: &mut Frame) -> Result<ReadOutcome> {
        let backend = self.backend.as_mut().ok_or(Error::NotOpen)?;

        let (width, height) = match backend.read(&mut frame.data)? {
            ReadOutcome::EndOfStream => return Ok(ReadOutcome::EndOfStream),
            ReadOutcome::Frame { width, height } => (width, height),
        };

        let expected = width as usize * height as usize * RGB_CHANNELS;
        if expected == 0 || frame.data.len() != expected {
            return Err(Error::FrameAcquisitionFailed(format!(
                "got {} bytes for a {width}x{height} frame",
                frame.data.len()
            )));
        }
        frame.info.width = width;
        frame.info.height = height;

        if let Some(rotated) = frame.view().and_then(|view| rotate(&view, self.config.rotation)) {
            let (width, height) = rotated.dimensions();
            frame.set_pixels(width, height, rotated.as_raw());
        }

        frame.info.timestamp = Some(SystemTime::now());
        self.total_frames += 1;

        Ok(ReadOutcome::Frame {
            width: frame.info.width,
            height: frame.info.height,
        })
    }

    pub fn set(&mut self, property: Property, value: f64) -> Result<()> {
        self.backend
            .as_mut()
            .ok_or(Error::NotOpen)?
            .set(property, value)
    }

    /// Release the backend. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            debug!(source = %self.config.kind, frames = self.total_frames, "Source closed");
        }
        self.actual = None;
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("kind", &self.config.kind)
            .field("open", &self.is_open())
            .field("actual", &self.actual)
            .field("total_frames", &self.total_frames)
            .finish()
    }
}
