//! Bounded sample queue between `write` callers and the output callback.
//!
//! Producers block while the queue is full, which is what gives `write` its
//! backpressure. The output callback only ever pops without blocking. Closing the queue
//! wakes every waiter so `stop`/`close` can interrupt a blocked writer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Thread-safe bounded queue of interleaved PCM16 samples.
///
/// A single [`Condvar`] signals every state change; the `closed` flag lives under the
/// same mutex as the samples so no wakeup can be missed.
pub struct PcmQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct QueueInner {
    samples: VecDeque<i16>,
    closed: bool,
}

/// Queue capacity in **samples** for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to half a second. Always at least one
/// frame.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        0.5
    };

    let frames = ((rate_hz as f32 * secs).ceil() as usize).max(1);
    frames.saturating_mul(channels.max(1))
}

impl PcmQueue {
    pub fn new(max_buffered_samples: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(max_buffered_samples),
                closed: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity_samples(&self) -> usize {
        self.max_buffered_samples
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Refuse further data and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns `true` once every sample is queued, `false` if the queue was closed first
    /// (also for an empty slice).
    /// On `false` a prefix of `samples` may already have been queued.
    pub fn push_blocking(&self, samples: &[i16]) -> bool {
        if samples.is_empty() {
            return !self.lock().closed;
        }
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();

            while g.samples.len() >= self.max_buffered_samples && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.closed {
                return false;
            }

            let room = self.max_buffered_samples - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Move up to `out.len()` samples into `out` without blocking. Returns the count.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut g = self.lock();
        let take = g.samples.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(g.samples.drain(..take)) {
            *dst = src;
        }
        drop(g);
        if take > 0 {
            self.cv.notify_all();
        }
        take
    }

    /// Block until the queue is empty (`true`) or closed (`false`).
    pub fn wait_until_empty(&self) -> bool {
        let mut g = self.lock();
        loop {
            if g.closed {
                return false;
            }
            if g.samples.is_empty() {
                return true;
            }
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
