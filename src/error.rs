use std::fmt;
use std::path::PathBuf;

/// Errors produced by the capture pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("source {source_desc} unavailable: {reason}")]
    SourceUnavailable { source_desc: String, reason: String },

    #[error("frame acquisition failed: {0}")]
    FrameAcquisitionFailed(String),

    #[error("failed to open video writer {}: {reason}", .path.display())]
    WriterOpenFailed { path: PathBuf, reason: String },

    #[error("job queue closed")]
    QueueClosed,

    #[error("frame pool exhausted ({0} frames checked out)")]
    PoolExhausted(usize),

    #[error("stream {0} is file-backed but has no input files")]
    EmptyPlaylist(u32),

    #[error("source is not file-backed")]
    NotFileBacked,

    #[error("source is not open")]
    NotOpen,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream {0} is running")]
    StreamRunning(u32),

    #[error("no stream with id {0}")]
    UnknownStream(u32),

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unavailable(source_desc: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::SourceUnavailable {
            source_desc: source_desc.into(),
            reason: reason.to_string(),
        }
    }
}

/// One stream that failed during a store-wide operation
#[derive(Debug)]
pub struct StreamFailure {
    pub stream_id: u32,
    pub stream_name: String,
    pub error: Error,
}

/// Aggregated failures of a store-wide open or start.
///
/// Failing streams never stop the remaining ones from being processed.
#[derive(Debug, thiserror::Error)]
#[error("{} of {total} streams failed: {}", .failures.len(), summary(.failures))]
pub struct StoreError {
    pub total: usize,
    pub failures: Vec<StreamFailure>,
}

impl StoreError {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<u32> {
        self.failures.iter().map(|f| f.stream_id).collect()
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

fn summary(failures: &[StreamFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("stream {} ({}): {}", f.stream_id, f.stream_name, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
