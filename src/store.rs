//! A location's streams, started and stopped together.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::capture::FramePool;
use crate::error::{Error, Result, StoreError, StreamFailure};
use crate::pipeline::{ClipOutput, Launch, Shutdown, Stream};
use crate::{Config, PipelineMode, StoreConfig};

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StoreStatus {
    #[default]
    None,
    Open,
    /// Closed and every task joined
    Closed,
    /// Shutdown fired, tasks may still be winding down
    Inactive,
}

pub struct Store {
    info: StoreConfig,
    status: StoreStatus,
    streams: Vec<Stream>,
    next_stream_id: u32,
    pool: Arc<FramePool>,
    mode: PipelineMode,
    clips: Option<ClipOutput>,
    shutdown: Option<Shutdown>,
}

impl Store {
    pub fn new(info: StoreConfig, pool: Arc<FramePool>, mode: PipelineMode) -> Self {
        Self {
            info,
            status: StoreStatus::None,
            streams: Vec::new(),
            next_stream_id: 1,
            pool,
            mode,
            clips: None,
            shutdown: None,
        }
    }

    /// Store settings taken from a loaded configuration
    pub fn from_config(config: &Config, pool: Arc<FramePool>) -> Self {
        let mut store = Self::new(config.store.clone(), pool, config.pipeline.mode);
        if config.records() {
            if let Some(dir) = &config.record.output {
                store.set_clip_output(ClipOutput {
                    dir: dir.clone(),
                    fps: config.pipeline.fps,
                    quality: config.record.jpeg_quality,
                });
            }
        }
        store
    }

    pub fn set_clip_output(&mut self, clips: ClipOutput) {
        self.clips = Some(clips);
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn location(&self) -> &str {
        &self.info.location
    }

    pub fn status(&self) -> StoreStatus {
        self.status
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Started and not yet closed
    pub fn is_active(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|s| !s.is_triggered())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Add a stream and hand out its id. Ids are never reused.
    pub fn register(&mut self, mut stream: Stream) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        stream.assign(&self.info.id, id);
        info!(store = %self.info.id, stream = id, name = stream.name(), "Stream registered");
        self.streams.push(stream);
        id
    }

    /// Remove a stream that is not running
    pub fn unregister(&mut self, id: u32) -> Result<Stream> {
        let idx = self
            .streams
            .iter()
            .position(|s| s.id() == id)
            .ok_or(Error::UnknownStream(id))?;
        if self.streams[idx].is_running() {
            return Err(Error::StreamRunning(id));
        }
        let mut stream = self.streams.remove(idx);
        stream.join();
        stream.close();
        Ok(stream)
    }

    pub fn stream(&self, id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id() == id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }

    /// Open every stream; failures are collected, never short-circuit
    #[instrument(skip(self), fields(store = %self.info.id))]
    pub fn open(&mut self) -> std::result::Result<(), StoreError> {
        let total = self.streams.len();
        let failures: Vec<_> = self
            .streams
            .iter_mut()
            .filter_map(|stream| match stream.open() {
                Ok(()) => None,
                Err(e) => {
                    error!(stream = stream.id(), name = stream.name(), "Failed to open: {}", e);
                    Some(failure(stream, e))
                }
            })
            .collect();

        self.status = StoreStatus::Open;
        info!(opened = total - failures.len(), total, "Store opened");
        aggregate(total, failures)
    }

    /// Launch every open stream's tasks.
    ///
    /// Streams that are not open are reported with [`Error::NotOpen`] and
    /// skipped; the rest start regardless.
    #[instrument(skip(self), fields(store = %self.info.id, mode = ?self.mode))]
    pub fn start(&mut self) -> std::result::Result<(), StoreError> {
        let shutdown = match self.shutdown.take() {
            Some(shutdown) if !shutdown.is_triggered() => shutdown,
            _ => Shutdown::new(),
        };
        let launch = Launch {
            mode: self.mode,
            pool: Arc::clone(&self.pool),
            shutdown: shutdown.signal(),
            clips: self.clips.clone(),
        };
        self.shutdown = Some(shutdown);

        let total = self.streams.len();
        let failures: Vec<_> = self
            .streams
            .iter_mut()
            .filter_map(|stream| match stream.start(&launch) {
                Ok(()) => None,
                Err(e) => {
                    warn!(stream = stream.id(), name = stream.name(), "Not started: {}", e);
                    Some(failure(stream, e))
                }
            })
            .collect();

        info!(started = total - failures.len(), total, "Store started");
        aggregate(total, failures)
    }

    /// Fire the shutdown broadcast. Does not wait; safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.as_mut() {
            if shutdown.trigger() {
                info!(store = %self.info.id, "Shutdown signalled");
            }
        }
        for stream in &mut self.streams {
            stream.close();
        }
        if self.status != StoreStatus::Closed {
            self.status = StoreStatus::Inactive;
        }
    }

    /// No stream has a live task
    pub fn is_idle(&self) -> bool {
        self.streams.iter().all(|s| !s.is_running())
    }

    /// Block until every task has exited
    pub fn join(&mut self) {
        for stream in &mut self.streams {
            stream.join();
        }
        if self.status == StoreStatus::Inactive {
            self.status = StoreStatus::Closed;
        }
    }

    /// Close, then wait up to `grace` for tasks to exit.
    ///
    /// Returns false if some task outlived the grace period; those are
    /// detached.
    pub fn shutdown(&mut self, grace: Duration) -> bool {
        self.close();

        let deadline = Instant::now() + grace;
        while !self.is_idle() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }

        let clean = self.is_idle();
        for stream in &mut self.streams {
            stream.reap();
            stream.detach();
        }
        self.status = StoreStatus::Closed;

        if clean {
            info!(store = %self.info.id, "All tasks stopped");
        } else {
            warn!(store = %self.info.id, ?grace, "Tasks still running after grace period");
        }
        clean
    }

    /// Human readable summary of the store and its streams
    pub fn describe(&self) -> String {
        let mut out = format!(
            "store {} \"{}\" at {:?}: {:?}, {:?} mode, {} streams",
            self.info.id,
            self.info.name,
            self.info.location,
            self.status,
            self.mode,
            self.streams.len()
        );
        for stream in &self.streams {
            let _ = write!(out, "\n  {}", stream.describe());
        }
        let pool = self.pool.stats();
        let _ = write!(
            out,
            "\n  pool: {} allocated, {} idle, {} exhausted",
            pool.allocated, pool.idle, pool.exhausted
        );
        out
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

fn failure(stream: &Stream, error: Error) -> StreamFailure {
    StreamFailure {
        stream_id: stream.id(),
        stream_name: stream.name().to_string(),
        error,
    }
}

fn aggregate(total: usize, failures: Vec<StreamFailure>) -> std::result::Result<(), StoreError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(StoreError { total, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraConfig, SourceKind};
    use crate::pipeline::StreamConfig;
    use crate::PoolConfig;

    fn store() -> Store {
        Store::new(
            StoreConfig::default(),
            FramePool::new(&PoolConfig::default()),
            PipelineMode::Detect,
        )
    }

    fn stream(source: &str) -> Stream {
        Stream::new(StreamConfig::new(
            source,
            CameraConfig::new(SourceKind::parse(source)),
        ))
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut store = store();
        let a = store.register(stream("stub://a"));
        let b = store.register(stream("stub://b"));
        assert_eq!((a, b), (1, 2));

        store.unregister(b).unwrap();
        assert!(store.stream(b).is_none());
        let c = store.register(stream("stub://c"));
        assert_eq!(c, 3);
        assert!(matches!(store.unregister(99), Err(Error::UnknownStream(99))));
    }

    #[test]
    fn close_before_start_is_harmless() {
        let mut store = store();
        store.register(stream("stub://a?frames=1"));
        store.close();
        store.close();
        assert_eq!(store.status(), StoreStatus::Inactive);
        assert!(!store.is_active());
    }

    #[test]
    fn start_reports_unopened_streams() {
        let mut store = store();
        let id = store.register(stream("stub://a?frames=1"));
        let err = store.start().unwrap_err();
        assert_eq!(err.failed_ids(), vec![id]);
        assert!(matches!(err.failures[0].error, Error::NotOpen));
        assert!(store.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn describe_lists_streams() {
        let mut store = store();
        store.register(stream("stub://front"));
        let text = store.describe();
        assert!(text.contains("store store-1"));
        assert!(text.contains("[1] stub://front"));
    }
}
