//! V4L2 device capture over memory-mapped buffers

use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};
use tracing::{debug, info, instrument};

use crate::capture::backend::{CaptureBackend, Negotiated, OpenParams, Property, ReadOutcome};
use crate::capture::decoder::decode_frame;
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};

const BUFFER_COUNT: u32 = 4;

// Control ids from linux/v4l2-controls.h
const CID_BASE: u32 = 0x0098_0900;
const CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const CID_BRIGHTNESS: u32 = CID_BASE;
const CID_CONTRAST: u32 = CID_BASE + 1;
const CID_SATURATION: u32 = CID_BASE + 2;
const CID_GAIN: u32 = CID_BASE + 19;
const CID_SHARPNESS: u32 = CID_BASE + 27;
const CID_EXPOSURE_AUTO: u32 = CID_CAMERA_CLASS_BASE + 1;
const CID_EXPOSURE_ABSOLUTE: u32 = CID_CAMERA_CLASS_BASE + 2;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

pub struct V4l2Capture {
    path: String,
    stream: Option<MmapStream<'static>>,
    device: Box<Device>,
    format: PixelFormat,
    negotiated: Negotiated,
}

impl V4l2Capture {
    #[instrument(skip(params))]
    pub fn open(path: &str, params: &OpenParams) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| Error::unavailable(path, e))?;

        let caps = device.query_caps().map_err(|e| Error::unavailable(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::unavailable(path, "device doesn't support video capture"));
        }

        let mut fmt = device.format().map_err(|e| Error::unavailable(path, e))?;
        if params.width > 0 && params.height > 0 {
            fmt.width = params.width;
            fmt.height = params.height;
        }
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = device.set_format(&fmt).map_err(|e| Error::unavailable(path, e))?;

        let format = if fmt.fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else {
            return Err(Error::unavailable(
                path,
                format!("unsupported pixel format {}", fmt.fourcc),
            ));
        };

        let mut fps = params.fps;
        if fps > 0 {
            match device.set_params(&Parameters::with_fps(fps)) {
                Ok(applied) if applied.interval.numerator > 0 => {
                    fps = applied.interval.denominator / applied.interval.numerator;
                }
                Ok(_) => {}
                Err(e) => debug!("Device refused frame rate {}: {}", fps, e),
            }
        }

        // The stream holds its own handle to the device
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| Error::unavailable(path, e))?;

        info!(
            "Capture stream started: {}x{} {:?} @ {} fps",
            fmt.width, fmt.height, format, fps
        );

        Ok(Self {
            path: path.to_string(),
            stream: Some(stream),
            device: Box::new(device),
            format,
            negotiated: Negotiated {
                width: fmt.width,
                height: fmt.height,
                fps,
            },
        })
    }
}

impl CaptureBackend for V4l2Capture {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        let stream = self.stream.as_mut().ok_or(Error::NotOpen)?;
        let (data, meta) = stream
            .next()
            .map_err(|e| Error::FrameAcquisitionFailed(format!("{}: {e}", self.path)))?;

        let used = (meta.bytesused as usize).min(data.len());
        let decoded = decode_frame(
            &data[..used],
            self.format,
            self.negotiated.width,
            self.negotiated.height,
        )?;

        buf.clear();
        buf.extend_from_slice(&decoded.pixels);
        Ok(ReadOutcome::Frame {
            width: decoded.width,
            height: decoded.height,
        })
    }

    fn set(&mut self, property: Property, value: f64) -> Result<()> {
        let (id, value) = match property {
            Property::AutoExposure => (
                CID_EXPOSURE_AUTO,
                if value < 0.5 {
                    EXPOSURE_MANUAL
                } else {
                    EXPOSURE_APERTURE_PRIORITY
                },
            ),
            Property::Exposure => (CID_EXPOSURE_ABSOLUTE, value as i64),
            Property::Brightness => (CID_BRIGHTNESS, value as i64),
            Property::Contrast => (CID_CONTRAST, value as i64),
            Property::Saturation => (CID_SATURATION, value as i64),
            Property::Gain => (CID_GAIN, value as i64),
            Property::Sharpness => (CID_SHARPNESS, value as i64),
        };

        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(Error::Io)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(path = %self.path, "V4L2 stream stopped");
        }
    }
}
