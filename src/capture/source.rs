//! Pull-style capture boundary

use std::collections::VecDeque;

use thiserror::Error;

use super::frame::{Frame, FrameId};
use super::lease::{Lease, LeaseCounter};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture stream exhausted")]
    Exhausted,

    #[error("capture device disconnected: {0}")]
    Disconnected(String),

    #[error("capture device error: {0}")]
    Device(String),
}

/// Supplier of timestamped frames at its own cadence.
///
/// `Ok(None)` means no frame is ready yet and is not an error. Any `Err`
/// means the source cannot produce frames anymore.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn name(&self) -> &str {
        "frame-source"
    }
}

/// Hands out strictly increasing frame ids and their leases
#[derive(Debug, Clone, Default)]
pub struct FrameSequencer {
    last: u64,
    leases: LeaseCounter,
}

impl FrameSequencer {
    pub fn new(leases: LeaseCounter) -> Self {
        Self { last: 0, leases }
    }

    /// Ids start at 1
    pub fn next_id(&mut self) -> FrameId {
        self.last += 1;
        FrameId(self.last)
    }

    pub fn lease(&self) -> Lease {
        self.leases.acquire()
    }

    pub fn issued(&self) -> u64 {
        self.last
    }
}

/// Replays a prepared sequence of frames.
///
/// `None` entries stand for polls where the device had nothing new.
pub struct ReplaySource {
    script: VecDeque<Option<Frame>>,
    idle_when_empty: bool,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            script: frames.into_iter().map(Some).collect(),
            idle_when_empty: false,
        }
    }

    pub fn from_script(script: impl IntoIterator<Item = Option<Frame>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            idle_when_empty: false,
        }
    }

    /// Keep reporting "no frame yet" instead of failing once the script runs out
    pub fn idle_when_empty(mut self) -> Self {
        self.idle_when_empty = true;
        self
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.script.pop_front() {
            Some(entry) => Ok(entry),
            None if self.idle_when_empty => Ok(None),
            None => Err(CaptureError::Exhausted),
        }
    }

    fn name(&self) -> &str {
        "replay"
    }
}
