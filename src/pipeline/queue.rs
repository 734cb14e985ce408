//! Bounded job queue between a stream's capture task and its consumer.
//!
//! Capture never drops a frame: a full queue blocks the producer until the
//! consumer catches up or the store shuts down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Selector, Sender, TrySendError};

use crate::error::{Error, Result};
use crate::pipeline::shutdown::ShutdownSignal;

#[derive(Default)]
struct Counters {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    full_waits: AtomicUsize,
}

/// Shared view of a queue's traffic.
///
/// Holds no end of the channel, so jobs still queued are dropped once both
/// the sender and the receiver are gone.
#[derive(Clone)]
pub struct QueueStats {
    counters: Arc<CachePadded<Counters>>,
    capacity: usize,
}

/// Point in time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub depth: usize,
    pub pushed: usize,
    pub popped: usize,
    /// Pushes that had to wait for room
    pub full_waits: usize,
}

/// Producer half
pub struct JobSender<T> {
    tx: Sender<T>,
    counters: Arc<CachePadded<Counters>>,
}

/// Consumer half
pub struct JobReceiver<T> {
    rx: Receiver<T>,
    counters: Arc<CachePadded<Counters>>,
}

/// Create a queue holding at most `capacity` jobs
pub fn job_queue<T: Send + 'static>(capacity: usize) -> (JobSender<T>, JobReceiver<T>, QueueStats) {
    let capacity = capacity.max(1);
    let (tx, rx) = flume::bounded(capacity);
    let counters = Arc::new(CachePadded::new(Counters::default()));

    let stats = QueueStats {
        counters: Arc::clone(&counters),
        capacity,
    };

    (
        JobSender {
            tx,
            counters: Arc::clone(&counters),
        },
        JobReceiver { rx, counters },
        stats,
    )
}

impl<T> JobSender<T> {
    /// Enqueue a job, blocking while the queue is full.
    ///
    /// Fails with [`Error::QueueClosed`] once shutdown fires or the consumer
    /// is gone; the job is dropped in that case.
    pub fn push(&self, job: T, shutdown: &ShutdownSignal) -> Result<()> {
        if shutdown.is_triggered() {
            return Err(Error::QueueClosed);
        }

        let job = match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(_)) => return Err(Error::QueueClosed),
        };

        self.counters.full_waits.fetch_add(1, Ordering::Relaxed);
        let sent = Selector::new()
            .send(&self.tx, job, |res| res.is_ok())
            .recv(shutdown.receiver(), |_| false)
            .wait();

        if sent {
            self.counters.pushed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(Error::QueueClosed)
        }
    }
}

impl<T> JobReceiver<T> {
    /// Block until a job arrives.
    ///
    /// Returns `None` on shutdown, or once the producer is gone and the
    /// queue has drained.
    pub fn pop(&self, shutdown: &ShutdownSignal) -> Option<T> {
        if shutdown.is_triggered() {
            return None;
        }

        let job = match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(flume::TryRecvError::Disconnected) => None,
            Err(flume::TryRecvError::Empty) => Selector::new()
                .recv(&self.rx, |res| res.ok())
                .recv(shutdown.receiver(), |_| None)
                .wait(),
        };

        if job.is_some() {
            self.counters.popped.fetch_add(1, Ordering::Relaxed);
        }
        job
    }

    /// Drop whatever is still queued, counting it as popped
    pub fn drain(&self) -> usize {
        let drained = self.rx.drain().count();
        self.counters.popped.fetch_add(drained, Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueSnapshot {
        let pushed = self.counters.pushed.load(Ordering::Relaxed);
        let popped = self.counters.popped.load(Ordering::Relaxed);
        QueueSnapshot {
            capacity: self.capacity,
            depth: pushed.saturating_sub(popped),
            pushed,
            popped,
            full_waits: self.counters.full_waits.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameInfo, FramePool};
    use crate::pipeline::shutdown::Shutdown;
    use crate::PoolConfig;
    use std::time::{Duration, SystemTime};

    #[test]
    fn frame_keeps_metadata_through_queue() {
        let pool = FramePool::new(&PoolConfig {
            initial_frames: 1,
            max_frames: 1,
            grow_on_demand: false,
            frame_bytes_hint: 0,
        });
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, _) = job_queue(2);

        let info = FrameInfo {
            store_id: "store-1".into(),
            stream_id: 3,
            frame_id: 41,
            action_id: 2,
            timestamp: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            width: 2,
            height: 1,
        };
        let mut frame = pool.acquire().unwrap();
        frame.set_pixels(2, 1, &[1, 2, 3, 4, 5, 6]);
        frame.info = info.clone();

        tx.push(frame, &signal).unwrap();
        let frame = rx.pop(&signal).unwrap();
        assert_eq!(frame.info, info);
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn fifo_order() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, stats) = job_queue(4);
        for i in 0..4 {
            tx.push(i, &signal).unwrap();
        }
        let popped: Vec<_> = (0..4).filter_map(|_| rx.pop(&signal)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);

        let snap = stats.snapshot();
        assert_eq!((snap.pushed, snap.popped, snap.depth), (4, 4, 0));
    }

    #[test]
    fn full_queue_blocks_until_consumed() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, stats) = job_queue(1);
        tx.push(1, &signal).unwrap();

        let producer = {
            let signal = signal.clone();
            std::thread::spawn(move || tx.push(2, &signal).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.pop(&signal), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(rx.pop(&signal), Some(2));
        assert_eq!(stats.snapshot().full_waits, 1);
    }

    #[test]
    fn shutdown_wakes_blocked_producer_and_consumer() {
        let mut shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, _) = job_queue::<u32>(1);
        tx.push(0, &signal).unwrap();

        let producer = {
            let signal = signal.clone();
            std::thread::spawn(move || tx.push(1, &signal))
        };
        let (_keep_tx, rx2, _) = job_queue::<u32>(1);
        let consumer = {
            let signal = signal.clone();
            std::thread::spawn(move || rx2.pop(&signal))
        };

        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        assert!(matches!(producer.join().unwrap(), Err(Error::QueueClosed)));
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(rx.pop(&signal), None);
    }

    #[test]
    fn queued_jobs_are_dropped_with_the_queue() {
        let pool = FramePool::new(&PoolConfig {
            initial_frames: 3,
            max_frames: 3,
            grow_on_demand: false,
            frame_bytes_hint: 0,
        });
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, stats) = job_queue(4);
        for _ in 0..3 {
            tx.push(pool.acquire().unwrap(), &signal).unwrap();
        }
        assert_eq!(stats.snapshot().depth, 3);
        assert_eq!(pool.stats().idle, 0);

        drop(tx);
        drop(rx);
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn drain_empties_the_queue() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, stats) = job_queue(4);
        tx.push(1, &signal).unwrap();
        tx.push(2, &signal).unwrap();
        assert_eq!(rx.drain(), 2);
        assert!(rx.is_empty());
        assert_eq!(stats.snapshot().depth, 0);
    }

    #[test]
    fn consumer_drains_after_producer_leaves() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let (tx, rx, _) = job_queue(4);
        tx.push(7, &signal).unwrap();
        drop(tx);
        assert_eq!(rx.pop(&signal), Some(7));
        assert_eq!(rx.pop(&signal), None);
    }
}
