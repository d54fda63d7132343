use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::lease::Lease;

/// Capture sequence number; unique and strictly increasing per source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One captured image.
///
/// A frame is owned by exactly one stage at a time and is moved, never
/// cloned, on hand-off. Its lease is released when the last owner drops it.
pub struct Frame {
    /// Immutable pixel data
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Capture timestamp for staleness tracking
    pub timestamp: Instant,

    lease: Lease,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub id: FrameId,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats a source may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    Yuyv4,
    Nv12,
    Mjpeg,
    /// Anything else, by fourcc
    Unknown(u32),
}

impl PixelFormat {
    /// Map a V4L2 fourcc onto a known format
    pub fn from_fourcc(code: &[u8; 4]) -> Self {
        match code {
            b"RGB3" => PixelFormat::Rgb24,
            b"BGR3" => PixelFormat::Bgr24,
            b"GREY" => PixelFormat::Gray8,
            b"YUYV" => PixelFormat::Yuyv4,
            b"NV12" => PixelFormat::Nv12,
            b"MJPG" => PixelFormat::Mjpeg,
            other => PixelFormat::Unknown(u32::from_le_bytes(*other)),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Gray8 => *b"GREY",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Unknown(code) => code.to_le_bytes(),
        }
    }

    /// Bytes per row of the first plane for packed and planar formats
    pub fn min_stride(self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(width * 3),
            PixelFormat::Yuyv4 => Some(width * 2),
            PixelFormat::Gray8 | PixelFormat::Nv12 => Some(width),
            PixelFormat::Mjpeg | PixelFormat::Unknown(_) => None,
        }
    }
}

impl Frame {
    /// Build a frame stamped with the current time and no ownership tracking
    pub fn new(id: FrameId, width: u32, height: u32, format: PixelFormat, data: Bytes) -> Self {
        Self {
            data,
            meta: FrameMetadata {
                id,
                width,
                height,
                stride: format.min_stride(width).unwrap_or(0),
                format,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
            lease: Lease::untracked(),
        }
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.meta.stride = stride;
        self
    }

    pub fn with_device_timestamp(mut self, ts: Duration) -> Self {
        self.meta.device_timestamp = Some(ts);
        self
    }

    pub fn id(&self) -> FrameId {
        self.meta.id
    }

    /// Time since capture as seen at `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    pub fn is_tracked(&self) -> bool {
        self.lease.is_tracked()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
