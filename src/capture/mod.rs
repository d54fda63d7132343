pub mod frame;
pub mod lease;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameId, FrameMetadata, PixelFormat};
pub use lease::{Lease, LeaseCounter};
pub use source::{CaptureError, FrameSequencer, FrameSource, ReplaySource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
