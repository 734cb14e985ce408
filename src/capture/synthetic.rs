//! Synthetic `stub://` sources for tests and dry runs.
//!
//! A stub descriptor is a URL whose query configures the generated scene:
//!
//! ```text
//! stub://front_door?frames=120&width=320&height=240&motion=30..60&fail_every=50
//! ```
//!
//! - `frames`: finite length, after which reads return end of stream
//! - `width`, `height`, `fps`: negotiated values (default: requested ones)
//! - `motion=a..b`: a bright block moves across the scene for frames `a..b`
//! - `fail_every=k`: every k-th read fails
//! - `pace=1`: sleep one frame interval per read like a real device
//! - `unavailable=1`: opening fails
//! - `background`: gray level of the static scene (default 30)

use std::ops::Range;
use std::time::Duration;

use tracing::{debug, trace};
use url::Url;

use crate::capture::backend::{CaptureBackend, Negotiated, OpenParams, Property, ReadOutcome};
use crate::capture::frame::RGB_CHANNELS;
use crate::error::{Error, Result};

pub const STUB_SCHEME: &str = "stub://";

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: u32 = 25;
const DEFAULT_BACKGROUND: u8 = 30;

#[derive(Debug, Clone)]
struct SceneSpec {
    name: String,
    frames: Option<u64>,
    motion: Option<Range<u64>>,
    fail_every: Option<u64>,
    pace: bool,
    background: u8,
}

pub struct SyntheticSource {
    spec: SceneSpec,
    negotiated: Negotiated,
    reads: u64,
    produced: u64,
}

impl SyntheticSource {
    pub fn open(descriptor: &str, params: &OpenParams) -> Result<Self> {
        let url = Url::parse(descriptor).map_err(|e| Error::unavailable(descriptor, e))?;

        let mut spec = SceneSpec {
            name: url.host_str().unwrap_or("stub").to_string(),
            frames: None,
            motion: None,
            fail_every: None,
            pace: false,
            background: DEFAULT_BACKGROUND,
        };
        let mut negotiated = Negotiated {
            width: nonzero_or(params.width, DEFAULT_WIDTH),
            height: nonzero_or(params.height, DEFAULT_HEIGHT),
            fps: nonzero_or(params.fps, DEFAULT_FPS),
        };

        for (key, value) in url.query_pairs() {
            let bad = |what: &str| Error::unavailable(descriptor, format!("invalid {what}: {value}"));
            match key.as_ref() {
                "frames" => spec.frames = Some(value.parse().map_err(|_| bad("frames"))?),
                "width" => negotiated.width = value.parse().map_err(|_| bad("width"))?,
                "height" => negotiated.height = value.parse().map_err(|_| bad("height"))?,
                "fps" => negotiated.fps = value.parse().map_err(|_| bad("fps"))?,
                "motion" => spec.motion = Some(parse_range(&value).ok_or_else(|| bad("motion"))?),
                "fail_every" => {
                    spec.fail_every = Some(value.parse().map_err(|_| bad("fail_every"))?)
                }
                "pace" => spec.pace = value == "1" || value == "true",
                "background" => spec.background = value.parse().map_err(|_| bad("background"))?,
                "unavailable" if value == "1" || value == "true" => {
                    return Err(Error::unavailable(descriptor, "device not found"));
                }
                _ => {}
            }
        }

        if negotiated.width == 0 || negotiated.height == 0 {
            return Err(Error::unavailable(descriptor, "zero sized scene"));
        }

        debug!(
            name = %spec.name,
            width = negotiated.width,
            height = negotiated.height,
            fps = negotiated.fps,
            "Synthetic source opened"
        );

        Ok(Self {
            spec,
            negotiated,
            reads: 0,
            produced: 0,
        })
    }

    fn render(&self, index: u64, buf: &mut Vec<u8>) {
        let Negotiated { width, height, .. } = self.negotiated;
        let (w, h) = (width as usize, height as usize);

        buf.clear();
        buf.resize(w * h * RGB_CHANNELS, self.spec.background);

        let Some(motion) = &self.spec.motion else {
            return;
        };
        if !motion.contains(&index) {
            return;
        }

        // Block a quarter of the scene wide that slides right every frame
        let (bw, bh) = ((w / 4).max(1), (h / 4).max(1));
        let step = (w / 16).max(1);
        let travel = (w - bw).max(1);
        let x0 = ((index - motion.start) as usize * step) % travel;
        let y0 = (h - bh) / 2;

        for y in y0..y0 + bh {
            let row = (y * w + x0) * RGB_CHANNELS;
            buf[row..row + bw * RGB_CHANNELS].fill(u8::MAX);
        }
    }
}

impl CaptureBackend for SyntheticSource {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        self.reads += 1;

        if self.spec.pace && self.negotiated.fps > 0 {
            std::thread::sleep(Duration::from_secs(1) / self.negotiated.fps);
        }

        if self.spec.fail_every.is_some_and(|k| k > 0 && self.reads % k == 0) {
            buf.clear();
            return Err(Error::FrameAcquisitionFailed(format!(
                "{}: injected failure on read {}",
                self.spec.name, self.reads
            )));
        }

        if self.spec.frames.is_some_and(|n| self.produced >= n) {
            return Ok(ReadOutcome::EndOfStream);
        }

        self.render(self.produced, buf);
        self.produced += 1;

        Ok(ReadOutcome::Frame {
            width: self.negotiated.width,
            height: self.negotiated.height,
        })
    }

    fn set(&mut self, property: Property, value: f64) -> Result<()> {
        trace!(?property, value, "Synthetic source ignoring property");
        Ok(())
    }
}

fn nonzero_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

fn parse_range(value: &str) -> Option<Range<u64>> {
    let (start, end) = value.split_once("..")?;
    let range = start.trim().parse().ok()?..end.trim().parse().ok()?;
    (!range.is_empty()).then_some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> OpenParams {
        OpenParams {
            width: 64,
            height: 48,
            fps: 10,
        }
    }

    #[test]
    fn finite_scene_ends() {
        let mut src = SyntheticSource::open("stub://a?frames=2", &params()).unwrap();
        let mut buf = Vec::new();
        assert_eq!(
            src.read(&mut buf).unwrap(),
            ReadOutcome::Frame {
                width: 64,
                height: 48
            }
        );
        assert_eq!(buf.len(), 64 * 48 * 3);
        assert!(matches!(src.read(&mut buf), Ok(ReadOutcome::Frame { .. })));
        assert_eq!(src.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn query_overrides_requested_size() {
        let src = SyntheticSource::open("stub://a?width=32&height=16&fps=5", &params()).unwrap();
        assert_eq!(
            src.negotiated(),
            Negotiated {
                width: 32,
                height: 16,
                fps: 5
            }
        );
    }

    #[test]
    fn motion_window_changes_pixels() {
        let mut src = SyntheticSource::open("stub://a?motion=1..3", &params()).unwrap();
        let (mut a, mut b, mut c, mut d) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        src.read(&mut a).unwrap();
        src.read(&mut b).unwrap();
        src.read(&mut c).unwrap();
        src.read(&mut d).unwrap();

        assert!(a.iter().all(|&p| p == DEFAULT_BACKGROUND));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
    }

    #[test]
    fn injected_failures_and_unavailable() {
        let mut src = SyntheticSource::open("stub://a?fail_every=2", &params()).unwrap();
        let mut buf = Vec::new();
        assert!(src.read(&mut buf).is_ok());
        assert!(matches!(
            src.read(&mut buf),
            Err(Error::FrameAcquisitionFailed(_))
        ));
        assert!(src.read(&mut buf).is_ok());

        assert!(matches!(
            SyntheticSource::open("stub://gone?unavailable=1", &params()),
            Err(Error::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_range("3..7"), Some(3..7));
        assert_eq!(parse_range("7..3"), None);
        assert_eq!(parse_range("x"), None);
    }
}
