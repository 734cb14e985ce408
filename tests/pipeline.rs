use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use argus::capture::transform::encode_jpeg;
use argus::capture::{CameraConfig, FramePool, Resolution, SourceKind};
use argus::pipeline::{ClipOutput, Stream, StreamConfig};
use argus::utils::playlist_stream;
use argus::{Config, Error, PipelineMode, PoolConfig, Store, StoreConfig, StoreStatus};
use image::{ImageBuffer, Rgb, RgbImage};

fn pool() -> std::sync::Arc<FramePool> {
    FramePool::new(&PoolConfig {
        initial_frames: 8,
        max_frames: 64,
        grow_on_demand: true,
        frame_bytes_hint: 0,
    })
}

fn stub(name: &str, descriptor: &str) -> Stream {
    let mut camera = CameraConfig::new(SourceKind::parse(descriptor));
    camera.resolution = Resolution::new(96, 64);
    let mut config = StreamConfig::new(name, camera);
    config.detection.scale_factor = 2;
    config.detection.movement_thresh = 30;
    config.detection.max_no_movement_frames = 6;
    config.queue_capacity = 4;
    Stream::new(config)
}

fn write_clip(path: &Path, levels: &[u8]) {
    let mut file = fs::File::create(path).unwrap();
    for &level in levels {
        let img: RgbImage = ImageBuffer::from_pixel(32, 24, Rgb([level, level, level]));
        file.write_all(&encode_jpeg(&img, 90).unwrap()).unwrap();
    }
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn frame_ids_reach_the_consumer_without_gaps() {
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Detect);
    let id = store.register(stub("gapless", "stub://g?frames=300&fail_every=7&motion=100..120"));

    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = store.stream(id).unwrap().stats();
    assert_eq!(stats.frames_accepted, 300);
    assert!(stats.frames_rejected > 0);
    assert_eq!(stats.sequence_gaps, 0);
    assert_eq!(stats.events, 1);
}

#[test]
fn one_failing_stream_does_not_stop_the_other() {
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Detect);
    let good = store.register(stub("good", "stub://good?pace=1&fps=100"));
    let bad = store.register(stub("bad", "stub://bad?unavailable=1"));

    let err = store.open().unwrap_err();
    assert_eq!(err.len(), 1);
    assert_eq!(err.total, 2);
    assert_eq!(err.failed_ids(), vec![bad]);
    assert!(matches!(err.failures[0].error, Error::SourceUnavailable { .. }));
    assert!(err.to_string().contains("1 of 2 streams failed"));

    let err = store.start().unwrap_err();
    assert_eq!(err.failed_ids(), vec![bad]);
    assert!(store.is_active());
    assert!(store.stream(good).unwrap().is_running());

    std::thread::sleep(Duration::from_millis(50));
    assert!(store.shutdown(Duration::from_secs(5)));
    assert_eq!(store.status(), StoreStatus::Closed);
    assert!(store.stream(good).unwrap().stats().frames_accepted > 0);
}

#[test]
fn playlist_loops_open_every_file_each_lap() {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let path = dir.path().join(format!("{name}.mjpeg"));
            write_clip(&path, &[20, 20, 20, 20]);
            path
        })
        .collect();

    let mut config = Config::default();
    config.pipeline.videos_n_loops = 2;
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Videos);
    let id = store.register(Stream::new(playlist_stream("videos", files, &config)));

    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = store.stream(id).unwrap().stats();
    assert_eq!(stats.files_opened, 6);
    assert_eq!(stats.frames_accepted, 24);
    assert_eq!(stats.sequence_gaps, 0);
}

#[test]
fn motion_events_are_written_as_clips() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Detect);
    store.set_clip_output(ClipOutput {
        dir: dir.path().to_path_buf(),
        fps: 24,
        quality: 80,
    });
    let id = store.register(stub("porch", "stub://p?frames=80&motion=20..30"));

    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = store.stream(id).unwrap().stats();
    assert_eq!(stats.events, 1);
    assert_eq!(stats.clips_written, 1);

    let clips = files_in(&dir.path().join("porch"));
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].extension().unwrap(), "mjpeg");

    // Clips are valid file sources
    let mut config = Config::default();
    config.pipeline.videos_n_loops = 1;
    let mut replay = Store::new(StoreConfig::default(), pool(), PipelineMode::Videos);
    let rid = replay.register(Stream::new(playlist_stream("replay", clips, &config)));
    replay.open().unwrap();
    replay.start().unwrap();
    replay.join();
    assert_eq!(
        replay.stream(rid).unwrap().stats().frames_accepted,
        stats.frames_emitted
    );
}

#[test]
fn record_mode_writes_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Record);
    store.set_clip_output(ClipOutput {
        dir: dir.path().to_path_buf(),
        fps: 24,
        quality: 80,
    });
    let id = store.register(stub("garage", "stub://r?frames=25"));

    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = store.stream(id).unwrap().stats();
    assert_eq!(stats.frames_emitted, 25);
    assert_eq!(stats.events, 0);
    assert_eq!(stats.clips_written, 1);
    assert_eq!(files_in(&dir.path().join("garage")).len(), 1);
}

#[test]
fn close_is_idempotent_and_stops_tasks() {
    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Detect);
    let id = store.register(stub("loop", "stub://l?pace=1&fps=100"));
    store.open().unwrap();
    store.start().unwrap();

    store.close();
    store.close();
    assert_eq!(store.status(), StoreStatus::Inactive);
    assert!(!store.is_active());

    store.join();
    store.close();
    assert_eq!(store.status(), StoreStatus::Closed);
    assert!(!store.stream(id).unwrap().is_running());
}

#[test]
fn released_frames_come_back_clean_after_a_run() {
    let pool = pool();
    let mut store = Store::new(StoreConfig::default(), pool.clone(), PipelineMode::Detect);
    store.register(stub("a", "stub://a?frames=50"));
    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = pool.stats();
    assert_eq!(stats.acquired, stats.released);
    let frame = pool.acquire().unwrap();
    assert!(frame.data.is_empty());
    assert_eq!(frame.info.frame_id, 0);
    assert_eq!(frame.info.action_id, 0);
}

#[test]
fn shutdown_returns_queued_frames_to_the_pool() {
    let pool = pool();
    let mut store = Store::new(StoreConfig::default(), pool.clone(), PipelineMode::Detect);
    let mut camera = CameraConfig::new(SourceKind::parse("stub://endless"));
    camera.resolution = Resolution::new(640, 480);
    let mut config = StreamConfig::new("endless", camera);
    config.queue_capacity = 16;
    let id = store.register(Stream::new(config));

    store.open().unwrap();
    store.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert!(store.shutdown(Duration::from_secs(5)));

    let stats = pool.stats();
    assert!(stats.allocated > 0);
    assert_eq!(stats.idle, stats.allocated);
    assert_eq!(stats.acquired, stats.released);
    let queue = store.stream(id).unwrap().queue_stats().unwrap();
    assert_eq!(queue.capacity, 16);
    assert!(queue.pushed > 0);
}

#[test]
fn record_mode_keeps_capturing_when_the_clip_cannot_open() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"").unwrap();

    let mut store = Store::new(StoreConfig::default(), pool(), PipelineMode::Record);
    store.set_clip_output(ClipOutput {
        dir: blocker,
        fps: 24,
        quality: 80,
    });
    let id = store.register(stub("attic", "stub://r?frames=12"));

    store.open().unwrap();
    store.start().unwrap();
    store.join();

    let stats = store.stream(id).unwrap().stats();
    assert_eq!(stats.frames_accepted, 12);
    assert_eq!(stats.clips_written, 0);
}
