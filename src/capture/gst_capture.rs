//! GStreamer capture for network cameras and named devices

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::backend::{CaptureBackend, Negotiated, OpenParams, Property, ReadOutcome};
use crate::capture::frame::RGB_CHANNELS;
use crate::error::{Error, Result};

const PREROLL_TIMEOUT_SECS: u64 = 10;

/// Decoded RGB frames pulled from an appsink
pub struct GstCapture {
    source: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    negotiated: Negotiated,
    pending: Option<gst::Sample>,
}

/// Pipeline for a local device node
pub fn device_pipeline(device: &str, params: &OpenParams) -> String {
    let mut caps = String::from("video/x-raw,format=RGB");
    if params.width > 0 && params.height > 0 {
        caps.push_str(&format!(",width={},height={}", params.width, params.height));
    }
    format!(
        "v4l2src device={device} ! \
         decodebin ! \
         videoconvert ! \
         videoscale ! \
         {caps} ! \
         appsink name=sink"
    )
}

/// Pipeline for anything `uridecodebin` understands (rtsp, http, file uris)
pub fn network_pipeline(address: &str, params: &OpenParams) -> String {
    let rate = if params.fps > 0 {
        format!(" ! videorate ! video/x-raw,framerate={}/1", params.fps)
    } else {
        String::new()
    };
    format!(
        "uridecodebin uri={address} ! \
         videoconvert{rate} ! \
         video/x-raw,format=RGB ! \
         appsink name=sink"
    )
}

impl GstCapture {
    pub fn open(source: &str, description: &str) -> Result<Self> {
        gst::init().map_err(|e| Error::unavailable(source, e))?;

        info!("Pipeline: {}", description);
        let pipeline = gst::parse::launch(description)
            .map_err(|e| Error::unavailable(source, e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::unavailable(source, "not a pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::unavailable(source, "no appsink"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::unavailable(source, "sink is not an appsink"))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 2u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::unavailable(source, format!("{e:?}")))?;

        // The first sample tells us what was negotiated
        let first = appsink
            .try_pull_sample(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS))
            .ok_or_else(|| Error::unavailable(source, "no frames before timeout"));
        let first = match first {
            Ok(sample) => sample,
            Err(e) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(e);
            }
        };
        let info = video_info(&first).map_err(|e| Error::unavailable(source, e))?;

        let fps = info.fps();
        let negotiated = Negotiated {
            width: info.width(),
            height: info.height(),
            fps: if fps.denom() > 0 {
                (fps.numer() / fps.denom()).max(0) as u32
            } else {
                0
            },
        };
        debug!(?negotiated, "GStreamer caps negotiated");

        Ok(Self {
            source: source.to_string(),
            pipeline,
            appsink,
            negotiated,
            pending: Some(first),
        })
    }
}

fn video_info(sample: &gst::Sample) -> Result<gst_video::VideoInfo> {
    let caps = sample
        .caps()
        .ok_or_else(|| Error::Decode("sample has no caps".into()))?;
    gst_video::VideoInfo::from_caps(caps).map_err(|e| Error::Decode(e.to_string()))
}

impl CaptureBackend for GstCapture {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        let sample = match self.pending.take() {
            Some(sample) => sample,
            None => match self.appsink.pull_sample() {
                Ok(sample) => sample,
                Err(_) if self.appsink.is_eos() => return Ok(ReadOutcome::EndOfStream),
                Err(e) => {
                    return Err(Error::FrameAcquisitionFailed(format!(
                        "{}: {e}",
                        self.source
                    )))
                }
            },
        };

        let info = video_info(&sample)?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::FrameAcquisitionFailed("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| Error::FrameAcquisitionFailed("failed to map buffer".into()))?;

        // Rows may be padded
        let (width, height) = (info.width(), info.height());
        let row = width as usize * RGB_CHANNELS;
        let stride = info.stride()[0] as usize;
        buf.clear();
        for line in map.as_slice().chunks(stride.max(row)).take(height as usize) {
            buf.extend_from_slice(&line[..row.min(line.len())]);
        }

        Ok(ReadOutcome::Frame { width, height })
    }

    fn set(&mut self, property: Property, _value: f64) -> Result<()> {
        debug!(?property, source = %self.source, "Tuning not supported on GStreamer sources");
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline {}: {:?}", self.source, e);
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
