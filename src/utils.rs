use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::capture::{CameraConfig, FramePool, Resolution, Rotation, SourceKind, Tuning};
use crate::error::{Error, Result};
use crate::pipeline::record::CLIP_EXTENSION;
use crate::pipeline::{Offset, Stream, StreamConfig};
use crate::{Config, PipelineMode, Store};

/// `{"cams": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct CamsDocument {
    pub cams: Vec<CamEntry>,
}

/// One camera; anything left out falls back to the global configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CamEntry {
    #[serde(default)]
    pub id: Option<u32>,
    pub name: String,
    pub source: SourceKind,
    #[serde(default)]
    pub rotation: Rotation,
    pub resolution: Option<Resolution>,
    pub fps: Option<u32>,
    #[serde(flatten)]
    pub tuning: Tuning,
    pub pose_size: Option<Resolution>,
    pub pose_output_size: Option<Resolution>,
    pub pose_output_offset: Option<Offset>,
    pub scale_factor: Option<u32>,
    pub movement_thresh: Option<u32>,
    pub max_no_movement_frames: Option<u32>,
}

impl CamEntry {
    pub fn stream_config(&self, config: &Config) -> StreamConfig {
        let mut camera = CameraConfig::new(self.source.clone());
        camera.rotation = self.rotation;
        camera.tuning = self.tuning;
        if let Some(resolution) = self.resolution {
            camera.resolution = resolution;
        }
        if let Some(fps) = self.fps {
            camera.fps = fps;
        }

        let mut stream = base_stream_config(self.name.clone(), camera, config);
        stream.cam_id = self.id;
        stream.pose_size = self.pose_size;
        if let Some(size) = self.pose_output_size {
            stream.pose_output_size = size;
        }
        if let Some(offset) = self.pose_output_offset {
            stream.pose_output_offset = offset;
        }
        if let Some(scale_factor) = self.scale_factor {
            stream.detection.scale_factor = scale_factor.max(1);
        }
        if let Some(thresh) = self.movement_thresh {
            stream.detection.movement_thresh = thresh;
        }
        if let Some(max) = self.max_no_movement_frames {
            stream.detection.max_no_movement_frames = max;
        }
        stream
    }
}

fn base_stream_config(name: String, camera: CameraConfig, config: &Config) -> StreamConfig {
    let mut stream = StreamConfig::new(name, camera);
    stream.detection = config.detection;
    stream.videos_n_loops = config.pipeline.videos_n_loops;
    stream.queue_capacity = config.pipeline.queue_capacity;
    stream.retry_pause = Duration::from_millis(config.pipeline.retry_pause_ms);
    stream.frame_delay = (config.pipeline.frame_delay_ms > 0)
        .then(|| Duration::from_millis(config.pipeline.frame_delay_ms));
    stream
}

pub fn load_cams(path: &Path) -> Result<CamsDocument> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

/// Clips in `dir`, sorted by path
pub fn list_videos(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut videos = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_clip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(CLIP_EXTENSION) || ext.eq_ignore_ascii_case("mjpg"));
        if path.is_file() && is_clip {
            videos.push(path);
        }
    }
    videos.sort();
    Ok(videos)
}

/// A single file-backed stream over `files`
pub fn playlist_stream(name: &str, files: Vec<PathBuf>, config: &Config) -> StreamConfig {
    let first = files.first().cloned().unwrap_or_default();
    let mut camera = CameraConfig::new(SourceKind::File(first));
    camera.fps = config.pipeline.fps;
    let mut stream = base_stream_config(name.to_string(), camera, config);
    stream.playlist = files;
    stream
}

/// Build a store with the streams the configured mode calls for
pub fn build_store(config: &Config, pool: Arc<FramePool>) -> Result<Store> {
    let mut store = Store::from_config(config, pool);

    match config.pipeline.mode {
        PipelineMode::Videos => {
            let dir = config
                .pipeline
                .videos
                .as_deref()
                .ok_or_else(|| Error::Config("videos mode needs pipeline.videos".into()))?;
            let files = list_videos(dir)?;
            info!("Found {} videos in {}", files.len(), dir.display());
            store.register(Stream::new(playlist_stream("videos", files, config)));
        }
        PipelineMode::Detect | PipelineMode::Record => {
            for entry in cam_entries(config)? {
                store.register(Stream::new(entry.stream_config(config)));
            }
        }
    }

    Ok(store)
}

fn cam_entries(config: &Config) -> Result<Vec<CamEntry>> {
    let path = &config.pipeline.cams;
    if path.exists() {
        return Ok(load_cams(path)?.cams);
    }
    detect_fallback(path)
}

#[cfg(feature = "v4l2")]
fn detect_fallback(path: &Path) -> Result<Vec<CamEntry>> {
    tracing::warn!("{} not found, probing for a capture device", path.display());
    let device = auto_detect_device()?;
    Ok(vec![CamEntry {
        id: None,
        name: "auto".into(),
        source: SourceKind::DeviceName(device),
        rotation: Rotation::None,
        resolution: None,
        fps: None,
        tuning: Tuning::default(),
        pose_size: None,
        pose_output_size: None,
        pose_output_offset: None,
        scale_factor: None,
        movement_thresh: None,
        max_no_movement_frames: None,
    }])
}

#[cfg(not(feature = "v4l2"))]
fn detect_fallback(path: &Path) -> Result<Vec<CamEntry>> {
    Err(Error::Config(format!("camera document {} not found", path.display())))
}

/// First `/dev/video*` node that captures MJPEG or YUYV
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> Result<String> {
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            let usable = formats
                .iter()
                .any(|fmt| fmt.fourcc == FourCC::new(b"MJPG") || fmt.fourcc == FourCC::new(b"YUYV"));
            if usable {
                info!("Found capture device: {} - {}", path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(Error::unavailable("/dev/video*", "no suitable capture device found"))
}
