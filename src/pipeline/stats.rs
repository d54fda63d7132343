//! Process-wide pipeline state: drop counters, latency and staleness windows,
//! and the last published frame.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;

use super::ringbuf::BufferStats;
use crate::capture::FrameId;
use crate::error::DropReason;

/// Samples kept for mean and p99
const WINDOW: usize = 256;

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    published: AtomicU64,
    dropped: [AtomicU64; DropReason::COUNT],
    /// 0 means nothing published yet; ids start at 1
    last_published: AtomicU64,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    count: u64,
}

impl LatencyWindow {
    fn record(&mut self, sample: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.count += 1;
    }

    fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * p).ceil() as usize).clamp(1, sorted.len());
        Some(sorted[rank - 1])
    }
}

/// Running statistics shared by the scheduler, the engine and reporters.
///
/// Counters are lock-free; the sample windows sit behind short mutexes.
#[derive(Debug, Default)]
pub struct PipelineStats {
    counters: CachePadded<Counters>,
    latency: Mutex<LatencyWindow>,
    staleness: Mutex<LatencyWindow>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed inference call, timed from submission
    pub fn record_inference(&self, latency: Duration) {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency);
        metrics::histogram!("edgesight_inference_latency_us").record(latency.as_micros() as f64);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.counters.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("edgesight_frames_dropped", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_published(&self, id: FrameId, staleness: Duration) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.counters.last_published.fetch_max(id.0, Ordering::AcqRel);
        self.staleness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(staleness);
        metrics::counter!("edgesight_frames_published").increment(1);
        metrics::histogram!("edgesight_staleness_us").record(staleness.as_micros() as f64);
    }

    pub fn last_published(&self) -> Option<FrameId> {
        match self.counters.last_published.load(Ordering::Acquire) {
            0 => None,
            id => Some(FrameId(id)),
        }
    }

    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.counters.dropped[reason.index()].load(Ordering::Relaxed)
    }

    /// Explicit restart; nothing else clears state
    pub fn reset(&self) {
        let c = &self.counters;
        c.submitted.store(0, Ordering::Relaxed);
        c.published.store(0, Ordering::Relaxed);
        c.last_published.store(0, Ordering::Release);
        for slot in &c.dropped {
            slot.store(0, Ordering::Relaxed);
        }
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = LatencyWindow::default();
        *self.staleness.lock().unwrap_or_else(PoisonError::into_inner) = LatencyWindow::default();
    }

    /// Combine scheduler-side counters with the frame buffer's
    pub fn snapshot(&self, buffer: BufferStats) -> StatsSnapshot {
        let mut dropped = [0u64; DropReason::COUNT];
        for reason in DropReason::ALL {
            dropped[reason.index()] = self.dropped(reason);
        }
        dropped[DropReason::BufferFull.index()] += buffer.dropped as u64;

        let latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        let staleness = self.staleness.lock().unwrap_or_else(PoisonError::into_inner);

        StatsSnapshot {
            captured: buffer.pushed as u64,
            submitted: self.submitted(),
            published: self.published(),
            dropped,
            backlog: buffer.held,
            last_published: self.last_published(),
            inferences: latency.count,
            mean_latency: latency.mean(),
            p99_latency: latency.percentile(0.99),
            mean_staleness: staleness.mean(),
        }
    }
}

/// Point-in-time view for reporting
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub submitted: u64,
    pub published: u64,
    dropped: [u64; DropReason::COUNT],
    pub backlog: usize,
    pub last_published: Option<FrameId>,
    pub inferences: u64,
    pub mean_latency: Option<Duration>,
    pub p99_latency: Option<Duration>,
    pub mean_staleness: Option<Duration>,
}

impl StatsSnapshot {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()]
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().sum()
    }

    /// Dropped frames per captured frame
    pub fn drop_rate(&self) -> f64 {
        if self.captured == 0 {
            0.0
        } else {
            self.total_dropped() as f64 / self.captured as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |d: Option<Duration>| d.map_or(0.0, |d| d.as_secs_f64() * 1_000.0);
        write!(
            f,
            "captured={} published={} dropped={} ({:.1}%) latency avg={:.1}ms p99={:.1}ms staleness avg={:.1}ms",
            self.captured,
            self.published,
            self.total_dropped(),
            self.drop_rate() * 100.0,
            ms(self.mean_latency),
            ms(self.p99_latency),
            ms(self.mean_staleness),
        )?;
        for reason in DropReason::ALL {
            let n = self.dropped(reason);
            if n > 0 {
                write!(f, " {}={}", reason, n)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_folds_in_buffer_drops() {
        let stats = PipelineStats::new();
        stats.record_drop(DropReason::Timeout);
        stats.record_drop(DropReason::BufferFull);

        let snap = stats.snapshot(BufferStats {
            pushed: 10,
            taken: 4,
            dropped: 5,
            held: 1,
        });
        assert_eq!(snap.dropped(DropReason::Timeout), 1);
        assert_eq!(snap.dropped(DropReason::BufferFull), 6);
        assert_eq!(snap.total_dropped(), 7);
        assert!((snap.drop_rate() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn latency_window_reports_mean_and_p99() {
        let stats = PipelineStats::new();
        for ms in 1..=100 {
            stats.record_inference(Duration::from_millis(ms));
        }
        let snap = stats.snapshot(BufferStats::default());
        assert_eq!(snap.inferences, 100);
        assert_eq!(snap.p99_latency, Some(Duration::from_millis(99)));
        assert_eq!(snap.mean_latency, Some(Duration::from_micros(50_500)));
    }

    #[test]
    fn reset_clears_everything() {
        let stats = PipelineStats::new();
        stats.record_submitted();
        stats.record_published(FrameId(3), Duration::from_millis(5));
        assert_eq!(stats.last_published(), Some(FrameId(3)));

        stats.reset();
        let snap = stats.snapshot(BufferStats::default());
        assert_eq!(snap.submitted, 0);
        assert_eq!(snap.published, 0);
        assert_eq!(snap.last_published, None);
        assert_eq!(snap.mean_staleness, None);
    }
}
