//! Reusable frame pool shared by every stream of a store.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::capture::Frame;
use crate::error::{Error, Result};
use crate::PoolConfig;

/// Pool of frames recycled between capture and consumers.
///
/// Idle frames live in an MPMC channel, so `acquire` and `release` may be
/// called from any pipeline thread. The total number of frames ever allocated
/// is capped by `max_frames`.
pub struct FramePool {
    idle_tx: Sender<Frame>,
    idle_rx: Receiver<Frame>,
    grow_on_demand: bool,
    max_frames: usize,
    frame_bytes: usize,
    stats: CachePadded<PoolCounters>,
}

#[derive(Default)]
struct PoolCounters {
    allocated: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicUsize,
}

/// Point in time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub idle: usize,
    pub acquired: usize,
    pub released: usize,
    pub exhausted: usize,
}

impl FramePool {
    /// Create a pool warmed with `config.initial_frames` frames
    pub fn new(config: &PoolConfig) -> Arc<Self> {
        let max_frames = config.max_frames.max(config.initial_frames).max(1);
        let (idle_tx, idle_rx) = flume::bounded(max_frames);

        let pool = Self {
            idle_tx,
            idle_rx,
            grow_on_demand: config.grow_on_demand,
            max_frames,
            frame_bytes: config.frame_bytes_hint,
            stats: CachePadded::new(PoolCounters::default()),
        };

        for _ in 0..config.initial_frames.min(max_frames) {
            pool.stats.allocated.fetch_add(1, Ordering::Relaxed);
            // Capacity equals max_frames so warm-up never blocks
            let _ = pool.idle_tx.try_send(Frame::with_capacity(pool.frame_bytes));
        }

        debug!(
            initial = config.initial_frames,
            max = max_frames,
            "Frame pool warmed"
        );

        Arc::new(pool)
    }

    /// Take a frame without waiting.
    ///
    /// Returns [`Error::PoolExhausted`] when no idle frame exists and either
    /// growth is disabled or the cap has been reached.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledFrame> {
        if let Ok(frame) = self.idle_rx.try_recv() {
            return Ok(self.checkout(frame));
        }

        if self.grow_on_demand && self.try_reserve_slot() {
            return Ok(self.checkout(Frame::with_capacity(self.frame_bytes)));
        }

        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(Error::PoolExhausted(self.checked_out()))
    }

    /// Like [`acquire`](Self::acquire) but waits up to `timeout` for a release
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Result<PooledFrame> {
        match self.acquire() {
            Ok(frame) => Ok(frame),
            Err(Error::PoolExhausted(_)) => match self.idle_rx.recv_timeout(timeout) {
                Ok(frame) => Ok(self.checkout(frame)),
                Err(_) => Err(Error::PoolExhausted(self.checked_out())),
            },
            Err(e) => Err(e),
        }
    }

    /// Return a frame to the pool. Equivalent to dropping it.
    pub fn release(&self, frame: PooledFrame) {
        drop(frame);
    }

    fn checkout(self: &Arc<Self>, frame: Frame) -> PooledFrame {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(self),
        }
    }

    fn recycle(&self, mut frame: Frame) {
        frame.clear();
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        if self.idle_tx.try_send(frame).is_err() {
            // Only possible if more frames exist than the cap allows
            warn!("Frame pool full, dropping frame");
            self.stats.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn try_reserve_slot(&self) -> bool {
        self.stats
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_frames).then_some(n + 1)
            })
            .is_ok()
    }

    fn checked_out(&self) -> usize {
        self.stats
            .allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.idle_rx.len())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.stats.allocated.load(Ordering::Relaxed),
            idle: self.idle_rx.len(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

/// A frame checked out of a [`FramePool`].
///
/// Exactly one owner at a time; dropping it clears the frame and hands it
/// back to the pool.
pub struct PooledFrame {
    frame: Option<Frame>,
    pool: Arc<FramePool>,
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        self.frame.as_ref().expect("pooled frame taken")
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().expect("pooled frame taken")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.recycle(frame);
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("info", &self.frame.as_ref().map(|frame| &frame.info))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: usize, max: usize, grow: bool) -> PoolConfig {
        PoolConfig {
            initial_frames: initial,
            max_frames: max,
            grow_on_demand: grow,
            frame_bytes_hint: 0,
        }
    }

    #[test]
    fn released_frames_come_back_clean() {
        let pool = FramePool::new(&config(1, 1, false));

        let mut frame = pool.acquire().unwrap();
        frame.set_pixels(2, 1, &[200u8; 6]);
        frame.info.store_id = "store-1".into();
        frame.info.stream_id = 4;
        frame.info.frame_id = 77;
        frame.info.action_id = 2;
        pool.release(frame);

        let frame = pool.acquire().unwrap();
        assert!(frame.data.is_empty());
        assert_eq!(frame.info, crate::capture::FrameInfo::default());
        assert!(frame.view().is_none());
    }

    #[test]
    fn grows_until_cap_then_reports_exhaustion() {
        let pool = FramePool::new(&config(1, 3, true));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::PoolExhausted(3))));
        assert_eq!(pool.stats().allocated, 3);

        drop(b);
        let d = pool.acquire().unwrap();
        assert_eq!(pool.stats().allocated, 3);

        drop((a, c, d));
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn no_growth_when_disabled() {
        let pool = FramePool::new(&config(2, 8, false));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[test]
    fn acquire_timeout_waits_for_release() {
        let pool = FramePool::new(&config(1, 1, false));
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn concurrent_checkout_hands_each_frame_to_one_owner() {
        let pool = FramePool::new(&config(4, 4, false));
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let mut frame = pool.acquire_timeout(Duration::from_secs(5)).unwrap();
                        assert_eq!(frame.info.frame_id, 0);
                        frame.info.frame_id = worker * 1000 + i + 1;
                        frame.data.push(1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.allocated, 4);
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.acquired, stats.released);
    }
}
