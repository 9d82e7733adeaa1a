//! Thread-safe bounded queues for interleaved audio samples.
//!
//! [`SharedAudio`] is the hand-off between graph stages:
//! - decode thread → player queue
//! - render thread (varispeed + time-pitch) → mixer queue
//! - output callback drains the mixer queue (non-blocking)
//!
//! Shutdown is deterministic: `close()` wakes every waiter, producers stop pushing and
//! consumers drain what is left. A producer that dies closes with `fail()` instead, so
//! the consumer can tell a broken stream from a finished one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// - Multiple producers / multiple consumers.
/// - Bounded by `max_buffered_samples` to cap memory and latency.
/// - A single [`Condvar`] signals every state change; the `done` flag lives under the
///   same mutex as the samples.
///
/// Samples are interleaved (`frame0[ch0], frame0[ch1], frame1[ch0], ...`) and the
/// channel count is fixed for the lifetime of the queue.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
    failure: Option<String>,
}

/// Strategy for popping interleaved frames from the queue.
pub enum PopStrategy {
    /// Block until exactly `frames` are available, or return `None` if closed before enough data.
    BlockingExact { frames: usize },
    /// Block until at least one frame is available, then return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` if currently empty.
    NonBlocking { max_frames: usize },
}

/// Compute a queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// Non-finite or non-positive `buffer_seconds` falls back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SharedAudio {
    /// Create a new bounded queue holding at most `max_buffered_samples` samples.
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
                failure: None,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, g: MutexGuard<'a, SharedInner>) -> MutexGuard<'a, SharedInner> {
        self.cv.wait(g).unwrap_or_else(|e| e.into_inner())
    }

    /// Number of channels for the interleaved sample stream carried by this queue.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    /// Whether the queue has been closed by either side.
    ///
    /// Closed queues may still contain buffered samples until drained.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Whether the queue is closed and fully drained.
    pub fn is_finished(&self) -> bool {
        let g = self.lock();
        g.done && g.queue.is_empty()
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Close the queue because the producer failed. Buffered samples stay poppable.
    ///
    /// Only the first reason is kept.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut g = self.lock();
        g.done = true;
        if g.failure.is_none() {
            g.failure = Some(reason.into());
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Why the producer gave up, if it did.
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Close the queue and discard anything still buffered.
    pub fn close_and_clear(&self) {
        let mut g = self.lock();
        g.done = true;
        g.queue.clear();
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns early (dropping the remainder) if the queue is closed while waiting.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.wait(g);
            }
            if g.done {
                return;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
    }

    /// Pop interleaved frames using the requested strategy.
    ///
    /// Returns `None` when the queue is closed and no data can satisfy the request.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take_samples = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.queue.len() < want && !g.done {
                    g = self.wait(g);
                }
                if g.queue.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.queue.len() < self.channels && !g.done {
                    g = self.wait(g);
                }
                let available_frames = g.queue.len() / self.channels;
                if available_frames == 0 {
                    return None;
                }
                available_frames.min(max_frames) * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                let available_frames = g.queue.len() / self.channels;
                let take = available_frames.min(max_frames) * self.channels;
                if take == 0 {
                    return None;
                }
                take
            }
        };

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        let remaining = g.queue.len();
        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(remaining);
        Some(out)
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::debug!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "audio queue low watermark"
                );
            }
        }
    }
}

/// Block until `q` is closed+empty OR `cancel` becomes true.
///
/// Returns `true` if the queue drained normally, `false` if cancelled.
pub fn wait_until_done_and_empty_or_cancel(q: &Arc<SharedAudio>, cancel: &Arc<AtomicBool>) -> bool {
    let mut g = q.lock();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }

        if g.done && g.queue.is_empty() {
            return true;
        }

        let (ng, _timeout) = q
            .cv
            .wait_timeout(g, Duration::from_millis(50))
            .unwrap_or_else(|e| e.into_inner());
        g = ng;
    }
}
