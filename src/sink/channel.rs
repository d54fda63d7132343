use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::Sink;
use crate::aggregate::Annotated;

/// Forwards published frames over a bounded channel.
///
/// A full channel drops the newest publication instead of stalling the
/// scheduler.
pub struct ChannelSink {
    tx: Sender<Annotated>,
    overflow: Arc<AtomicU64>,
    disconnected: bool,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Annotated>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn new(tx: Sender<Annotated>) -> Self {
        Self {
            tx,
            overflow: Arc::new(AtomicU64::new(0)),
            disconnected: false,
        }
    }

    /// Publications discarded because the consumer fell behind or left
    pub fn overflow(&self) -> Arc<AtomicU64> {
        self.overflow.clone()
    }
}

impl Sink for ChannelSink {
    fn publish(&mut self, annotated: Annotated) {
        match self.tx.try_send(annotated) {
            Ok(()) => {}
            Err(TrySendError::Full(missed)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("edgesight_sink_overflow").increment(1);
                debug!("sink channel full, discarding frame {}", missed.frame.id());
            }
            Err(TrySendError::Disconnected(missed)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                if !self.disconnected {
                    warn!("sink consumer disconnected at frame {}", missed.frame.id());
                    self.disconnected = true;
                }
            }
        }
    }
}
