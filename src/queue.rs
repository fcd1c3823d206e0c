use crate::frame::TelemetryFrame;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Slots in the backing buffer. One slot above the retained bound so a push
/// never fails before the trim runs.
pub const QUEUE_CAPACITY: usize = 5;
/// Frames kept after a push; older ones are evicted.
pub const MAX_RETAINED_FRAMES: usize = 4;

const_assert!(MAX_RETAINED_FRAMES < QUEUE_CAPACITY);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_evicted: u64,
    /// Frames skipped because a newer one was taken by `pop_latest`.
    pub total_expired: u64,
    pub currently_queued: u8,
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub evicted: usize,
    pub queued: usize,
}

#[derive(Debug)]
struct Inner {
    frames: Deque<TelemetryFrame, QUEUE_CAPACITY>,
    stats: QueueStats,
}

/// Bounded FIFO shared between the feed subscriber (producer) and the
/// revision publisher (consumer). Both sides hold it through an `Arc`; every
/// operation takes the lock once and does constant work under it.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: Deque::new(),
                stats: QueueStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame, then evict from the front until at most
    /// `MAX_RETAINED_FRAMES` remain.
    pub fn push(&self, frame: TelemetryFrame) -> PushOutcome {
        let mut inner = self.lock();
        let mut evicted = 0;

        if inner.frames.is_full() {
            inner.frames.pop_front();
            evicted += 1;
        }
        // Cannot fail: a slot was freed above if the deque was full.
        let _ = inner.frames.push_back(frame);

        while inner.frames.len() > MAX_RETAINED_FRAMES {
            inner.frames.pop_front();
            evicted += 1;
        }

        inner.stats.total_pushed += 1;
        inner.stats.total_evicted += evicted as u64;
        inner.stats.currently_queued = inner.frames.len() as u8;

        PushOutcome {
            evicted,
            queued: inner.frames.len(),
        }
    }

    /// Take the most recently pushed frame and drop everything older.
    pub fn pop_latest(&self) -> Option<TelemetryFrame> {
        let mut inner = self.lock();
        let latest = inner.frames.pop_back()?;

        let expired = inner.frames.len();
        inner.frames.clear();

        inner.stats.total_expired += expired as u64;
        inner.stats.currently_queued = 0;

        Some(latest)
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn get_stats(&self) -> QueueStats {
        self.lock().stats
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
