//! One source and the tasks that process it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, Counter, Gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::{Camera, CameraConfig, FramePool, PooledFrame, ReadOutcome, Resolution};
use crate::error::{Error, Result};
use crate::pipeline::motion::{MotionDetector, MotionTracker, Transition};
use crate::pipeline::queue::{job_queue, JobReceiver, JobSender, QueueSnapshot, QueueStats};
use crate::pipeline::record::{RecordSettings, Recorder};
use crate::pipeline::shutdown::ShutdownSignal;
use crate::{DetectionConfig, PipelineMode};

/// How long capture waits for a free frame before checking for shutdown
const POOL_WAIT: Duration = Duration::from_millis(100);

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: i32,
    pub y: i32,
}

/// Per-stream settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    /// Id from the camera document, informational only
    pub cam_id: Option<u32>,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    /// Output size; the actual resolution when unset
    pub pose_size: Option<Resolution>,
    pub pose_output_size: Resolution,
    pub pose_output_offset: Offset,
    /// Input files of a file-backed stream
    pub playlist: Vec<PathBuf>,
    pub videos_n_loops: u32,
    pub queue_capacity: usize,
    pub retry_pause: Duration,
    /// Pause after every capture iteration
    pub frame_delay: Option<Duration>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, camera: CameraConfig) -> Self {
        Self {
            name: name.into(),
            cam_id: None,
            camera,
            detection: DetectionConfig::default(),
            pose_size: None,
            pose_output_size: Resolution::new(150, 150),
            pose_output_offset: Offset::default(),
            playlist: Vec::new(),
            videos_n_loops: 1,
            queue_capacity: 32,
            retry_pause: Duration::from_millis(10),
            frame_delay: None,
        }
    }
}

/// Mapping between the source image and the output image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputGeometry {
    pub actual: Resolution,
    pub output_size: Resolution,
    /// actual / output_size, per axis
    pub output_scale: (f64, f64),
    pub pose_output_size: Resolution,
    pub pose_output_offset: Offset,
}

impl OutputGeometry {
    pub fn new(actual: Resolution, config: &StreamConfig) -> Self {
        let output_size = config
            .pose_size
            .filter(|size| !size.is_empty())
            .unwrap_or(actual);
        let scale = |a: u32, o: u32| if o == 0 { 1.0 } else { a as f64 / o as f64 };

        Self {
            actual,
            output_size,
            output_scale: (
                scale(actual.width, output_size.width),
                scale(actual.height, output_size.height),
            ),
            pose_output_size: config.pose_output_size,
            pose_output_offset: config.pose_output_offset,
        }
    }

    /// Map a point in output coordinates back onto the source image
    pub fn to_source(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x + self.pose_output_offset.x as f64) * self.output_scale.0,
            (y + self.pose_output_offset.y as f64) * self.output_scale.1,
        )
    }
}

/// Cumulative counters of a stream
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_read: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    frames_emitted: AtomicU64,
    events: AtomicU64,
    files_opened: AtomicU64,
    clips_written: AtomicU64,
    sequence_gaps: AtomicU64,
    pool_exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Read attempts that produced a frame or an error
    pub frames_read: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    /// Frames that belonged to an event, or were recorded
    pub frames_emitted: u64,
    pub events: u64,
    pub files_opened: u64,
    pub clips_written: u64,
    pub sequence_gaps: u64,
    pub pool_exhausted: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_read: load(&self.frames_read),
            frames_accepted: load(&self.frames_accepted),
            frames_rejected: load(&self.frames_rejected),
            frames_emitted: load(&self.frames_emitted),
            events: load(&self.events),
            files_opened: load(&self.files_opened),
            clips_written: load(&self.clips_written),
            sequence_gaps: load(&self.sequence_gaps),
            pool_exhausted: load(&self.pool_exhausted),
        }
    }
}

/// Updates both the stream's own counters and the metrics facade
#[derive(Clone)]
struct Tally {
    stats: Arc<StreamStats>,
    read: Counter,
    accepted: Counter,
    rejected: Counter,
    events: Counter,
    fps: Gauge,
}

impl Tally {
    fn new(store_id: &str, stream_id: u32, stats: Arc<StreamStats>) -> Self {
        let labels = [
            ("store", store_id.to_string()),
            ("stream", stream_id.to_string()),
        ];
        Self {
            stats,
            read: counter!("argus_frames_read_total", &labels),
            accepted: counter!("argus_frames_accepted_total", &labels),
            rejected: counter!("argus_frames_rejected_total", &labels),
            events: counter!("argus_events_total", &labels),
            fps: gauge!("argus_capture_fps", &labels),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self) {
        Self::bump(&self.stats.frames_read);
        self.read.increment(1);
    }

    fn accepted(&self) {
        Self::bump(&self.stats.frames_accepted);
        self.accepted.increment(1);
    }

    fn rejected(&self) {
        Self::bump(&self.stats.frames_rejected);
        self.rejected.increment(1);
    }

    fn event(&self) {
        Self::bump(&self.stats.events);
        self.events.increment(1);
    }

    fn emitted(&self) {
        Self::bump(&self.stats.frames_emitted);
    }

    fn file_opened(&self) {
        Self::bump(&self.stats.files_opened);
    }

    fn clip(&self) {
        Self::bump(&self.stats.clips_written);
    }

    fn gap(&self) {
        Self::bump(&self.stats.sequence_gaps);
    }

    fn pool_exhausted(&self) {
        Self::bump(&self.stats.pool_exhausted);
    }
}

/// Capture iterations per second, reported once per window
struct FpsMeter {
    started: Instant,
    count: u64,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.started.elapsed();
        if elapsed < FPS_WINDOW {
            return None;
        }
        let fps = self.count as f64 / elapsed.as_secs_f64();
        self.started = Instant::now();
        self.count = 0;
        Some(fps)
    }
}

/// Where clips go when a stream records
#[derive(Debug, Clone)]
pub struct ClipOutput {
    pub dir: PathBuf,
    pub fps: u32,
    pub quality: u8,
}

/// Everything a stream needs from its store to start
#[derive(Clone)]
pub struct Launch {
    pub mode: PipelineMode,
    pub pool: Arc<FramePool>,
    pub shutdown: ShutdownSignal,
    pub clips: Option<ClipOutput>,
}

/// Capture side of a running stream
struct Source {
    store_id: String,
    stream_id: u32,
    pool: Arc<FramePool>,
    shutdown: ShutdownSignal,
    tally: Tally,
    retry_pause: Duration,
    frame_delay: Option<Duration>,
    meter: FpsMeter,
    next_frame_id: u64,
}

enum Pulled {
    Frame(PooledFrame),
    /// Nothing this time, try again
    Skip,
    EndOfStream,
    Fatal(Error),
}

impl Source {
    /// End of one capture iteration: optional pause, then fps bookkeeping.
    /// Returns true if shutdown fired during the pause.
    fn pace(&mut self) -> bool {
        let stopped = self
            .frame_delay
            .is_some_and(|delay| self.shutdown.wait_timeout(delay));
        if let Some(fps) = self.meter.tick() {
            self.tally.fps.set(fps);
            debug!(stream = self.stream_id, fps = format_args!("{fps:.1}"), "Capture rate");
        }
        stopped
    }

    /// Acquire a frame and fill it from the camera
    fn pull(&mut self, camera: &mut Camera) -> Pulled {
        let mut frame = match self.pool.acquire_timeout(POOL_WAIT) {
            Ok(frame) => frame,
            Err(e) => {
                self.tally.pool_exhausted();
                trace!(stream = self.stream_id, "{}", e);
                return Pulled::Skip;
            }
        };

        match camera.read(&mut frame) {
            Ok(ReadOutcome::Frame { .. }) => {
                self.tally.read();
                self.tally.accepted();
                self.next_frame_id += 1;
                frame.info.store_id.clone_from(&self.store_id);
                frame.info.stream_id = self.stream_id;
                frame.info.frame_id = self.next_frame_id;
                Pulled::Frame(frame)
            }
            Ok(ReadOutcome::EndOfStream) => Pulled::EndOfStream,
            Err(Error::NotOpen) => Pulled::Fatal(Error::NotOpen),
            Err(e) => {
                self.tally.read();
                self.tally.rejected();
                debug!(stream = self.stream_id, "Discarding bad frame: {}", e);
                Pulled::Skip
            }
        }
    }
}

/// Consumer side of a running stream
struct Consumer {
    stream_id: u32,
    /// `None` records every frame
    detection: Option<(MotionDetector, MotionTracker)>,
    recorder: Recorder,
    tally: Tally,
    last_frame_id: u64,
}

impl Consumer {
    fn consume(&mut self, mut frame: PooledFrame) {
        let frame_id = frame.info.frame_id;
        if self.last_frame_id != 0 && frame_id != self.last_frame_id + 1 {
            self.tally.gap();
            warn!(
                stream = self.stream_id,
                expected = self.last_frame_id + 1,
                got = frame_id,
                "Frame sequence gap"
            );
        }
        self.last_frame_id = frame_id;

        let Some((detector, tracker)) = &mut self.detection else {
            self.tally.emitted();
            self.recorder.write(&frame);
            return;
        };

        let Some(view) = frame.view() else {
            debug!(stream = self.stream_id, frame = frame_id, "Frame has no image, skipped");
            return;
        };
        let score = detector.score(&view);
        let transition = tracker.update(score);

        if let Transition::Started { action_id } = transition {
            self.tally.event();
            info!(stream = self.stream_id, action_id, score, "Motion started");
            if let Err(e) = self.recorder.start() {
                error!(stream = self.stream_id, "{}", e);
            }
        }

        if let Some(action_id) = transition.action_id() {
            frame.info.action_id = action_id;
            self.tally.emitted();
            self.recorder.write(&frame);
        }

        if let Transition::Ended { action_id } = transition {
            info!(stream = self.stream_id, action_id, "Motion ended");
            if self.recorder.finish().is_some() {
                self.tally.clip();
            }
        }
    }

    fn finish(&mut self) {
        if let Some((_, tracker)) = &mut self.detection {
            if let Some(action_id) = tracker.force_close() {
                info!(stream = self.stream_id, action_id, "Motion event cut short");
            }
        }
        if self.recorder.finish().is_some() {
            self.tally.clip();
        }
    }
}

/// Capture task: device or network source feeding the queue
fn run_capture(mut camera: Camera, mut source: Source, tx: JobSender<PooledFrame>) -> Camera {
    info!(stream = source.stream_id, "Capture task started");

    while !source.shutdown.is_triggered() {
        match source.pull(&mut camera) {
            Pulled::Frame(frame) => {
                if tx.push(frame, &source.shutdown).is_err() {
                    break;
                }
                if source.pace() {
                    break;
                }
            }
            Pulled::Skip => {
                if source.shutdown.wait_timeout(source.retry_pause) {
                    break;
                }
            }
            Pulled::EndOfStream => {
                info!(stream = source.stream_id, "Source ended");
                break;
            }
            Pulled::Fatal(e) => {
                error!(stream = source.stream_id, "Capture stopped: {}", e);
                break;
            }
        }
    }

    camera.close();
    info!(
        stream = source.stream_id,
        frames = source.next_frame_id,
        "Capture task exited"
    );
    camera
}

/// Motion or record task draining the queue
fn run_consumer(rx: JobReceiver<PooledFrame>, shutdown: ShutdownSignal, mut consumer: Consumer) {
    info!(stream = consumer.stream_id, "Consumer task started");
    while let Some(frame) = rx.pop(&shutdown) {
        consumer.consume(frame);
    }
    let dropped = rx.drain();
    if dropped > 0 {
        debug!(stream = consumer.stream_id, dropped, "Queued frames returned to the pool");
    }
    consumer.finish();
    info!(stream = consumer.stream_id, "Consumer task exited");
}

/// Combined capture and consume over a playlist of files
fn run_playlist(
    mut camera: Camera,
    mut source: Source,
    playlist: Vec<PathBuf>,
    loops: u32,
    mut consumer: Consumer,
) -> Camera {
    info!(
        stream = source.stream_id,
        files = playlist.len(),
        loops,
        "Playlist task started"
    );

    'playlist: for lap in 1..=loops {
        for path in &playlist {
            if source.shutdown.is_triggered() {
                break 'playlist;
            }
            if let Err(e) = camera.open_file(path) {
                warn!(stream = source.stream_id, path = %path.display(), "Skipping file: {}", e);
                continue;
            }
            source.tally.file_opened();
            debug!(stream = source.stream_id, lap, path = %path.display(), "Playing file");

            loop {
                if source.shutdown.is_triggered() {
                    break 'playlist;
                }
                match source.pull(&mut camera) {
                    Pulled::Frame(frame) => {
                        consumer.consume(frame);
                        if source.pace() {
                            break 'playlist;
                        }
                    }
                    Pulled::Skip => {}
                    Pulled::EndOfStream => break,
                    Pulled::Fatal(e) => {
                        warn!(stream = source.stream_id, path = %path.display(), "{}", e);
                        break;
                    }
                }
            }
        }
    }

    consumer.finish();
    camera.close();
    info!(
        stream = source.stream_id,
        frames = source.next_frame_id,
        "Playlist task exited"
    );
    camera
}

/// A source plus its pipeline tasks
pub struct Stream {
    id: u32,
    store_id: String,
    config: StreamConfig,
    /// `None` while a task owns it
    camera: Option<Camera>,
    geometry: Option<OutputGeometry>,
    opened: bool,
    stats: Arc<StreamStats>,
    queue: Option<QueueStats>,
    source_task: Option<JoinHandle<Camera>>,
    consumer_task: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn new(mut config: StreamConfig) -> Self {
        if let crate::capture::SourceKind::File(path) = &config.camera.kind {
            if config.playlist.is_empty() && !path.as_os_str().is_empty() {
                config.playlist.push(path.clone());
            }
        }
        let camera = Camera::new(config.camera.clone());

        Self {
            id: 0,
            store_id: String::new(),
            config,
            camera: Some(camera),
            geometry: None,
            opened: false,
            stats: Arc::new(StreamStats::default()),
            queue: None,
            source_task: None,
            consumer_task: None,
        }
    }

    /// Called by the store on registration
    pub(crate) fn assign(&mut self, store_id: &str, id: u32) {
        self.store_id = store_id.to_string();
        self.id = id;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_file_backed(&self) -> bool {
        self.config.camera.kind.is_file()
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// The camera, unless a task currently owns it
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    pub fn geometry(&self) -> Option<&OutputGeometry> {
        self.geometry.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_stats(&self) -> Option<QueueSnapshot> {
        self.queue.as_ref().map(QueueStats::snapshot)
    }

    /// Any task still alive
    pub fn is_running(&self) -> bool {
        self.source_task.as_ref().is_some_and(|h| !h.is_finished())
            || self.consumer_task.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn has_tasks(&self) -> bool {
        self.source_task.is_some() || self.consumer_task.is_some()
    }

    /// Open the source and derive the output geometry
    #[instrument(skip(self), fields(stream = self.id, name = %self.config.name))]
    pub fn open(&mut self) -> Result<()> {
        if self.has_tasks() {
            return Err(Error::StreamRunning(self.id));
        }
        let camera = self.camera.as_mut().ok_or(Error::StreamRunning(self.id))?;

        if self.config.camera.kind.is_file() {
            let first = self
                .config
                .playlist
                .first()
                .ok_or(Error::EmptyPlaylist(self.id))?;
            camera.open_file(first)?;
        } else {
            camera.open()?;
        }

        let actual = camera.actual().ok_or(Error::NotOpen)?;
        let geometry = OutputGeometry::new(Resolution::new(actual.width, actual.height), &self.config);
        info!(
            actual = %geometry.actual,
            output = %geometry.output_size,
            "Stream opened"
        );

        self.geometry = Some(geometry);
        self.opened = true;
        Ok(())
    }

    /// Launch the task set for this stream's source kind and the mode
    #[instrument(skip(self, launch), fields(stream = self.id, mode = ?launch.mode))]
    pub fn start(&mut self, launch: &Launch) -> Result<()> {
        if self.has_tasks() {
            return Err(Error::StreamRunning(self.id));
        }
        if !self.opened {
            return Err(Error::NotOpen);
        }
        let geometry = self.geometry.ok_or(Error::NotOpen)?;

        let tally = Tally::new(&self.store_id, self.id, Arc::clone(&self.stats));
        let settings = launch.clips.as_ref().map(|clips| RecordSettings {
            output: clips.dir.clone(),
            fps: clips.fps,
            size: geometry.output_size,
            quality: clips.quality,
        });

        let mut recorder = Recorder::new(self.config.name.clone(), settings);
        let detection = match launch.mode {
            PipelineMode::Record => {
                if let Err(e) = recorder.start() {
                    error!("Recording disabled, capture continues: {}", e);
                }
                None
            }
            PipelineMode::Detect | PipelineMode::Videos => Some((
                MotionDetector::from_config(&self.config.detection),
                MotionTracker::from_config(&self.config.detection),
            )),
        };
        let consumer = Consumer {
            stream_id: self.id,
            detection,
            recorder,
            tally: tally.clone(),
            last_frame_id: 0,
        };
        let source = Source {
            store_id: self.store_id.clone(),
            stream_id: self.id,
            pool: Arc::clone(&launch.pool),
            shutdown: launch.shutdown.clone(),
            tally,
            retry_pause: self.config.retry_pause,
            frame_delay: self.config.frame_delay,
            meter: FpsMeter::new(),
            next_frame_id: 0,
        };

        let camera = self.camera.take().ok_or(Error::NotOpen)?;
        // Tasks own the camera from here on and close it on exit
        self.opened = false;

        if self.is_file_backed() {
            let playlist = self.config.playlist.clone();
            let loops = self.config.videos_n_loops;
            self.source_task = Some(spawn(format!("stream-{}", self.id), move || {
                run_playlist(camera, source, playlist, loops, consumer)
            })?);
        } else {
            let (tx, rx, queue) = job_queue(self.config.queue_capacity);
            self.queue = Some(queue);

            let consumer_name = match launch.mode {
                PipelineMode::Record => format!("stream-record-{}", self.id),
                _ => format!("stream-motion-{}", self.id),
            };
            let shutdown = launch.shutdown.clone();
            self.consumer_task = Some(spawn(consumer_name, move || {
                run_consumer(rx, shutdown, consumer)
            })?);
            self.source_task = Some(spawn(format!("stream-{}", self.id), move || {
                run_capture(camera, source, tx)
            })?);
        }

        info!("Stream started");
        Ok(())
    }

    /// Wait for the tasks and take the camera back
    pub fn join(&mut self) {
        if let Some(handle) = self.source_task.take() {
            match handle.join() {
                Ok(camera) => self.camera = Some(camera),
                Err(_) => error!(stream = self.id, "Capture task panicked"),
            }
        }
        if let Some(handle) = self.consumer_task.take() {
            if handle.join().is_err() {
                error!(stream = self.id, "Consumer task panicked");
            }
        }
    }

    /// Join whatever has already finished, without blocking
    pub(crate) fn reap(&mut self) {
        if !self.is_running() {
            self.join();
        }
    }

    /// Let go of tasks that did not finish in time
    pub(crate) fn detach(&mut self) {
        if self.has_tasks() {
            warn!(stream = self.id, "Detaching tasks that did not stop");
        }
        self.source_task = None;
        self.consumer_task = None;
    }

    /// Close the source if no task owns it. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(camera) = self.camera.as_mut() {
            camera.close();
        }
        self.opened = false;
    }

    pub fn describe(&self) -> String {
        let state = if self.is_running() {
            "running"
        } else if self.opened {
            "open"
        } else {
            "closed"
        };
        let stats = self.stats();
        format!(
            "[{}] {} ({}) {}: {} accepted, {} rejected, {} events, {} clips",
            self.id,
            self.config.name,
            self.config.camera.kind,
            state,
            stats.frames_accepted,
            stats.frames_rejected,
            stats.events,
            stats.clips_written,
        )
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("source", &self.config.camera.kind)
            .field("open", &self.opened)
            .field("running", &self.is_running())
            .finish()
    }
}

fn spawn<T, F>(name: String, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::ThreadSpawn { name, source })
}
