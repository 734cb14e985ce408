//! Store-wide shutdown broadcast.
//!
//! The trigger owns the only sender of a channel nobody ever sends on.
//! Dropping it disconnects the channel, which every clone of the signal
//! observes at once, including threads parked in a select.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

pub struct Shutdown {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

/// Cheap handle given to every task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx: Some(tx), rx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }

    /// Fire the broadcast. Returns false if it had already fired.
    pub fn trigger(&mut self) -> bool {
        self.tx.take().is_some()
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.is_none()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.rx.is_disconnected()
    }

    /// Sleep for up to `timeout`, returning early (with true) on shutdown
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
