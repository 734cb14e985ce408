pub mod capture;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use error::{Error, Result, StoreError, StreamFailure};
pub use store::{Store, StoreStatus};

/// Environment variables `ARGUS__<SECTION>__<KEY>` override file values
pub const ENV_PREFIX: &str = "ARGUS";
pub const ENV_SEPARATOR: &str = "__";

/// System configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub pool: PoolConfig,
    pub record: RecordConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub id: String,
    pub name: String,
    pub location: String,
}

/// Which task set each stream runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Cameras from the cams document, motion detection
    #[default]
    Detect,
    /// One file-backed stream over a directory of clips
    Videos,
    /// Cameras from the cams document, continuous recording
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    /// Clip frame rate; also the rate reported by file sources
    pub fps: u32,
    pub queue_capacity: usize,
    pub videos_n_loops: u32,
    pub cams: PathBuf,
    pub videos: Option<PathBuf>,
    /// Pause before retrying a failed device read
    pub retry_pause_ms: u64,
    /// Pause after every captured frame, 0 disables it
    pub frame_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub scale_factor: u32,
    pub movement_thresh: u32,
    pub max_no_movement_frames: u32,
    /// Per-pixel intensity change that counts as motion
    pub diff_threshold: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_frames: usize,
    pub max_frames: usize,
    pub grow_on_demand: bool,
    pub frame_bytes_hint: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Write motion clips in detect and videos modes
    pub enabled: bool,
    pub output: Option<PathBuf>,
    pub jpeg_quality: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            id: "store-1".into(),
            name: "argus".into(),
            location: String::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Detect,
            fps: 24,
            queue_capacity: 32,
            videos_n_loops: 1,
            cams: PathBuf::from("config/cams.json"),
            videos: None,
            retry_pause_ms: 10,
            frame_delay_ms: 0,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale_factor: 6,
            movement_thresh: 800,
            max_no_movement_frames: 60,
            diff_threshold: 45,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_frames: 64,
            max_frames: 512,
            grow_on_demand: true,
            frame_bytes_hint: 640 * 480 * 3,
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output: None,
            jpeg_quality: 85,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then the environment.
    ///
    /// Not validated, so that command line overrides can still be applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.detection.scale_factor == 0 {
            return fail("detection.scale_factor must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            return fail("pipeline.queue_capacity must be at least 1");
        }
        if self.pipeline.videos_n_loops == 0 {
            return fail("pipeline.videos_n_loops must be at least 1");
        }
        if self.pool.max_frames < self.pool.initial_frames {
            return fail("pool.max_frames is below pool.initial_frames");
        }
        if self.records() && self.record.output.is_none() {
            return fail("recording needs record.output");
        }
        if self.pipeline.mode == PipelineMode::Videos && self.pipeline.videos.is_none() {
            return fail("videos mode needs pipeline.videos");
        }
        Ok(())
    }

    /// Whether any clip gets written
    pub fn records(&self) -> bool {
        self.record.enabled || self.pipeline.mode == PipelineMode::Record
    }
}
