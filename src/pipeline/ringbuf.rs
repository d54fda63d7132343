//! Bounded frame exchange between the capture unit and the scheduler

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::trace;

use crate::capture::{Frame, FrameId};
use crate::error::DropReason;

/// What happens when a frame arrives and the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Evict the oldest held frame to make room
    #[default]
    DropOldest,
    /// Keep what is held and discard the arrival
    DropNewest,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The frame was stored and this older one evicted
    Evicted(FrameId),
    /// The incoming frame was discarded
    Rejected(FrameId),
}

impl PushOutcome {
    pub fn dropped(self) -> Option<FrameId> {
        match self {
            PushOutcome::Stored => None,
            PushOutcome::Evicted(id) | PushOutcome::Rejected(id) => Some(id),
        }
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pushed: usize,
    pub taken: usize,
    pub dropped: usize,
    pub held: usize,
}

/// Fixed-capacity frame exchange with explicit drop accounting.
///
/// Push never blocks the producer and `try_take` never blocks the consumer.
/// Both sides serialize on one short critical section; evicted frames are
/// released after the lock is dropped.
pub struct FrameBuffer {
    ring: Mutex<HeapRb<Frame>>,
    policy: DropPolicy,
    ready: Notify,
    closed: AtomicBool,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_taken: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl FrameBuffer {
    /// A zero capacity is treated as one
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            policy,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn single_slot() -> Self {
        Self::new(1, DropPolicy::DropOldest)
    }

    /// The ring holds only frames, whose state is valid at every await-free
    /// step, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HeapRb<Frame>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: store a frame, dropping per policy when full
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let id = frame.id();
        let dropped: Option<Frame>;
        let outcome = {
            let mut ring = self.lock();
            if !ring.is_full() {
                dropped = ring.try_push(frame).err();
                PushOutcome::Stored
            } else {
                match self.policy {
                    DropPolicy::DropOldest => {
                        dropped = ring.push_overwrite(frame);
                        dropped
                            .as_ref()
                            .map_or(PushOutcome::Stored, |old| PushOutcome::Evicted(old.id()))
                    }
                    DropPolicy::DropNewest => {
                        dropped = Some(frame);
                        PushOutcome::Rejected(id)
                    }
                }
            }
        };

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        if let Some(victim) = outcome.dropped() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("edgesight_frames_dropped", "reason" => DropReason::BufferFull.as_str())
                .increment(1);
            trace!("buffer full, dropped frame {}", victim);
        }
        drop(dropped);

        self.ready.notify_one();
        outcome
    }

    /// Consumer: oldest held frame, or `None` without waiting
    pub fn try_take(&self) -> Option<Frame> {
        let frame = self.lock().try_pop();
        if frame.is_some() {
            self.stats.frames_taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Resolves after the next push (or immediately if one happened since
    /// the last wake-up). Pair with `try_take`; may wake spuriously.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Mark the producer side finished and wake any waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every held frame; returns how many were dropped
    pub fn drain(&self) -> usize {
        let frames: Vec<Frame> = self.lock().pop_iter().collect();
        frames.len()
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity().get()
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            taken: self.stats.frames_taken.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            held: self.len(),
        }
    }
}
