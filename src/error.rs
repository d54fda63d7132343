//! Process-level errors and per-frame drop reasons

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::capture::{CaptureError, FrameId};
use crate::inference::ModelError;

/// Why a single frame never reached the sink.
///
/// Drops are absorbed by the cycle that observes them and only show up in
/// statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DropReason {
    ShapeMismatch,
    FormatUnsupported,
    Corrupt,
    Timeout,
    BufferFull,
    Stale,
    InferenceFailed,
}

impl DropReason {
    pub const COUNT: usize = 7;

    pub const ALL: [DropReason; Self::COUNT] = [
        DropReason::ShapeMismatch,
        DropReason::FormatUnsupported,
        DropReason::Corrupt,
        DropReason::Timeout,
        DropReason::BufferFull,
        DropReason::Stale,
        DropReason::InferenceFailed,
    ];

    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::ShapeMismatch => "shape_mismatch",
            DropReason::FormatUnsupported => "format_unsupported",
            DropReason::Corrupt => "corrupt",
            DropReason::Timeout => "timeout",
            DropReason::BufferFull => "buffer_full",
            DropReason::Stale => "stale",
            DropReason::InferenceFailed => "inference_failed",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions that make forward progress impossible
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(#[source] CaptureError),

    #[error("model load failed: {0}")]
    ModelLoadFailed(#[source] ModelError),

    /// Submitting while an inference is in flight; the scheduler never does this
    #[error("inference submitted for frame {0} while another was in flight")]
    EngineBusyViolation(FrameId),

    #[error("inference worker stopped unexpectedly")]
    EngineStopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
