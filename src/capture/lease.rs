//! Ownership accounting for frames and tensors.
//!
//! Every tracked resource holds a [`Lease`]; the lease is returned to its
//! [`LeaseCounter`] when the owner is dropped, wherever that happens. A
//! counter that reads zero after shutdown proves no stage kept a frame or
//! tensor alive.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

#[derive(Debug, Default)]
struct Counts {
    outstanding: CachePadded<AtomicUsize>,
    issued: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseCounter {
    counts: Arc<Counts>,
}

impl LeaseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Lease {
        self.counts.outstanding.fetch_add(1, Ordering::AcqRel);
        self.counts.issued.fetch_add(1, Ordering::Relaxed);
        Lease {
            counts: Some(self.counts.clone()),
        }
    }

    /// Leases handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.counts.outstanding.load(Ordering::Acquire)
    }

    pub fn issued(&self) -> u64 {
        self.counts.issued.load(Ordering::Relaxed)
    }
}

/// Released on drop
#[derive(Debug, Default)]
pub struct Lease {
    counts: Option<Arc<Counts>>,
}

impl Lease {
    pub fn untracked() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self) -> bool {
        self.counts.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(counts) = self.counts.take() {
            counts.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_a_lease_releases_it() {
        let counter = LeaseCounter::new();
        let a = counter.acquire();
        let b = counter.acquire();
        assert_eq!(counter.outstanding(), 2);

        drop(a);
        assert_eq!(counter.outstanding(), 1);
        drop(b);
        assert_eq!(counter.outstanding(), 0);
        assert_eq!(counter.issued(), 2);
    }

    #[test]
    fn untracked_lease_touches_nothing() {
        let counter = LeaseCounter::new();
        drop(Lease::untracked());
        assert_eq!(counter.outstanding(), 0);
    }
}
