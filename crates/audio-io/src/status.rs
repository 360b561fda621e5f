//! Stream counters and side-channel notifications.
//!
//! Overruns and underruns are glitches, not failures: the data path counts them and
//! posts a [`StreamEvent`] without ever blocking or returning an error.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Notification emitted by a running stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Capture data was lost because the consumer fell behind. `total` is cumulative.
    OverrunDetected { total: u64 },
    /// Playback ran out of data and the backend played silence. `total` is cumulative.
    UnderrunDetected { total: u64 },
    /// The stream hit an unrecoverable backend failure.
    Faulted { reason: String },
}

/// Bounded event channel shared by an engine and its backend callbacks.
#[derive(Clone, Debug)]
pub(crate) struct EventBus {
    tx: Sender<StreamEvent>,
    rx: Receiver<StreamEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Post without blocking. Events are dropped when nobody drains the channel.
    pub(crate) fn emit(&self, event: StreamEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => tracing::trace!(?ev, "event channel full, dropping"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<StreamEvent> {
        self.rx.clone()
    }
}

/// Capture counters, cumulative over the engine's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub delivered_chunks: u64,
    pub delivered_bytes: u64,
    /// Chunks that became ready while no sink was registered.
    pub dropped_chunks: u64,
    pub dropped_bytes: u64,
    pub overruns: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CaptureCounters {
    delivered_chunks: AtomicU64,
    delivered_bytes: AtomicU64,
    dropped_chunks: AtomicU64,
    dropped_bytes: AtomicU64,
    overruns: AtomicU64,
}

impl CaptureCounters {
    pub(crate) fn delivered(&self, bytes: usize) {
        self.delivered_chunks.fetch_add(1, Ordering::Relaxed);
        self.delivered_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, bytes: usize) {
        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
        self.dropped_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count one overrun and return the new total.
    pub(crate) fn overrun(&self) -> u64 {
        self.overruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            delivered_chunks: self.delivered_chunks.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// Playback counters, cumulative over the engine's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Bytes accepted by `write`.
    pub accepted_bytes: u64,
    /// Bytes of real audio handed to the backend (silence excluded).
    pub played_bytes: u64,
    pub underruns: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PlaybackCounters {
    accepted_bytes: AtomicU64,
    played_bytes: AtomicU64,
    underruns: AtomicU64,
}

impl PlaybackCounters {
    pub(crate) fn accepted(&self, bytes: usize) {
        self.accepted_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn played(&self, bytes: usize) {
        self.played_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn underrun(&self) -> u64 {
        self.underruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            accepted_bytes: self.accepted_bytes.load(Ordering::Relaxed),
            played_bytes: self.played_bytes.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}
