//! Clip output: Motion JPEG files under `<output>/<stream name>/`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::capture::transform::{encode_jpeg, resize};
use crate::capture::{Frame, Resolution};
use crate::error::{Error, Result};

pub const CLIP_EXTENSION: &str = "mjpeg";

/// One open clip
pub struct ClipWriter {
    path: PathBuf,
    out: BufWriter<File>,
    size: Resolution,
    fps: u32,
    quality: u8,
    frames_written: u64,
}

/// What a closed clip contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub fps: u32,
}

impl ClipWriter {
    /// Create `path` (and its parent directories). Never overwrites.
    pub fn open(path: &Path, fps: u32, size: Resolution, quality: u8) -> Result<Self> {
        let fail = |e: io::Error| Error::WriterOpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(fail)?;

        debug!(path = %path.display(), %size, fps, "Clip opened");

        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            size,
            fps,
            quality,
            frames_written: 0,
        })
    }

    /// Append a frame, resizing it to the clip size if needed
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let view = frame
            .view()
            .ok_or_else(|| Error::Decode("frame has no image".into()))?;

        let jpeg = if view.dimensions() == (self.size.width, self.size.height) || self.size.is_empty() {
            encode_jpeg(&view, self.quality)?
        } else {
            encode_jpeg(&resize(&view, self.size.width, self.size.height), self.quality)?
        };

        self.out.write_all(&jpeg)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close
    pub fn close(mut self) -> Result<ClipSummary> {
        self.out.flush()?;
        Ok(ClipSummary {
            path: self.path,
            frames: self.frames_written,
            fps: self.fps,
        })
    }
}

/// `<output>/<stream name>/<unix millis>.mjpeg`, suffixed if taken
pub fn clip_path(output: &Path, stream_name: &str, at: SystemTime) -> PathBuf {
    let dir = output.join(sanitize(stream_name));
    let millis = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let mut path = dir.join(format!("{millis}.{CLIP_EXTENSION}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{millis}-{n}.{CLIP_EXTENSION}"));
        n += 1;
    }
    path
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "stream".into()
    } else {
        cleaned
    }
}

/// Where and how a stream writes clips
#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub output: PathBuf,
    pub fps: u32,
    pub size: Resolution,
    pub quality: u8,
}

/// Opens and closes clips on behalf of a pipeline task
pub struct Recorder {
    stream_name: String,
    settings: Option<RecordSettings>,
    writer: Option<ClipWriter>,
    write_errors: u64,
}

impl Recorder {
    /// A recorder with no settings never writes anything
    pub fn new(stream_name: impl Into<String>, settings: Option<RecordSettings>) -> Self {
        Self {
            stream_name: stream_name.into(),
            settings,
            writer: None,
            write_errors: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Open a new clip, finishing any clip still open
    pub fn start(&mut self) -> Result<()> {
        let Some(settings) = &self.settings else {
            return Ok(());
        };
        let path = clip_path(&settings.output, &self.stream_name, SystemTime::now());
        let writer = ClipWriter::open(&path, settings.fps, settings.size, settings.quality)?;
        self.finish();
        self.writer = Some(writer);
        Ok(())
    }

    /// Write to the open clip, if any. Failures are counted, not returned.
    pub fn write(&mut self, frame: &Frame) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.write(frame) {
            self.write_errors += 1;
            warn!(
                stream = %self.stream_name,
                frame = frame.info.frame_id,
                "Failed to write frame: {}", e
            );
        }
    }

    /// Close the open clip, if any
    pub fn finish(&mut self) -> Option<ClipSummary> {
        let writer = self.writer.take()?;
        match writer.close() {
            Ok(summary) => {
                info!(
                    stream = %self.stream_name,
                    path = %summary.path.display(),
                    frames = summary.frames,
                    "Clip written"
                );
                Some(summary)
            }
            Err(e) => {
                warn!(stream = %self.stream_name, "Failed to close clip: {}", e);
                None
            }
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.finish();
    }
}
