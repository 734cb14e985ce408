//! Motion JPEG files: concatenated baseline JPEG images.
//!
//! This is also the format [`ClipWriter`](crate::pipeline::record::ClipWriter)
//! produces, so recorded clips can be fed back in as file sources.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::capture::backend::{CaptureBackend, Negotiated, OpenParams, Property, ReadOutcome};
use crate::capture::decoder::decode_jpeg;
use crate::error::{Error, Result};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Files carry no timing, so fall back to this when none was requested
const DEFAULT_FILE_FPS: u32 = 24;

pub struct MjpegFile {
    path: PathBuf,
    map: Mmap,
    pos: usize,
    negotiated: Negotiated,
}

impl MjpegFile {
    pub fn open(path: &Path, params: &OpenParams) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::unavailable(path.display().to_string(), e))?;
        // SAFETY: the file is opened read-only and clips are never rewritten in place
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::unavailable(path.display().to_string(), e))?;

        let mut source = Self {
            path: path.to_path_buf(),
            map,
            pos: 0,
            negotiated: Negotiated::default(),
        };

        // Probe the first image for the frame size
        let (start, end) = source
            .next_segment(0)
            .ok_or_else(|| Error::unavailable(path.display().to_string(), "no jpeg frames"))?;
        let probe = decode_jpeg(&source.map[start..end])
            .map_err(|e| Error::unavailable(path.display().to_string(), e))?;

        source.negotiated = Negotiated {
            width: probe.width,
            height: probe.height,
            fps: if params.fps > 0 {
                params.fps
            } else {
                DEFAULT_FILE_FPS
            },
        };

        debug!(
            path = %path.display(),
            width = probe.width,
            height = probe.height,
            bytes = source.map.len(),
            "Opened mjpeg file"
        );

        Ok(source)
    }

    /// Byte range of the next complete JPEG at or after `from`
    fn next_segment(&self, from: usize) -> Option<(usize, usize)> {
        let data = &self.map[..];
        let start = from + find(&data[from.min(data.len())..], &SOI)?;
        let end = start + 2 + find(&data[start + 2..], &EOI)? + 2;
        Some((start, end))
    }
}

impl CaptureBackend for MjpegFile {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read(&mut self, buf: &mut Vec<u8>) -> Result<ReadOutcome> {
        let Some((start, end)) = self.next_segment(self.pos) else {
            trace!(path = %self.path.display(), "End of mjpeg file");
            return Ok(ReadOutcome::EndOfStream);
        };
        // Skip a corrupt image instead of failing on it forever
        self.pos = end;

        let decoded = decode_jpeg(&self.map[start..end])?;
        buf.clear();
        buf.extend_from_slice(&decoded.pixels);

        Ok(ReadOutcome::Frame {
            width: decoded.width,
            height: decoded.height,
        })
    }

    fn set(&mut self, _property: Property, _value: f64) -> Result<()> {
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::transform::encode_jpeg;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::io::Write;

    fn write_clip(frames: &[u8], garbage_between: bool) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for &level in frames {
            let img: RgbImage = ImageBuffer::from_pixel(16, 8, Rgb([level, level, level]));
            file.write_all(&encode_jpeg(&img, 90).unwrap()).unwrap();
            if garbage_between {
                file.write_all(b"\x00\x01junk").unwrap();
            }
        }
        file.flush().unwrap();
        file
    }

    fn params() -> OpenParams {
        OpenParams {
            width: 0,
            height: 0,
            fps: 0,
        }
    }

    #[test]
    fn reads_every_frame_then_ends() {
        let clip = write_clip(&[10, 128, 250], true);
        let mut src = MjpegFile::open(clip.path(), &params()).unwrap();
        assert_eq!(
            src.negotiated(),
            Negotiated {
                width: 16,
                height: 8,
                fps: DEFAULT_FILE_FPS
            }
        );

        let mut buf = Vec::new();
        let mut levels = Vec::new();
        while let ReadOutcome::Frame { width, height } = src.read(&mut buf).unwrap() {
            assert_eq!((width, height), (16, 8));
            levels.push(buf[0]);
        }
        assert_eq!(levels.len(), 3);
        assert!(levels[0] < levels[1] && levels[1] < levels[2]);
        assert_eq!(src.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn missing_or_empty_file_is_unavailable() {
        assert!(matches!(
            MjpegFile::open(Path::new("/nonexistent/clip.mjpeg"), &params()),
            Err(Error::SourceUnavailable { .. })
        ));

        let empty = write_clip(&[], false);
        assert!(matches!(
            MjpegFile::open(empty.path(), &params()),
            Err(Error::SourceUnavailable { .. })
        ));
    }
}
