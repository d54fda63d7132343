//! V4L2 capture with memory-mapped buffers

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tokio::time::Instant;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, PixelFormat};
use super::lease::LeaseCounter;
use super::source::{CaptureError, FrameSequencer, FrameSource};
use crate::CaptureConfig;

/// Camera source backed by a V4L2 device
pub struct V4l2Source {
    // Declared before `device` so the mapped buffers are released first
    stream: Option<MmapStream<'static>>,
    device: Box<Device>,
    config: CaptureConfig,
    format: PixelFormat,
    stride: u32,
    sequencer: FrameSequencer,
}

impl V4l2Source {
    /// Open and configure the device; auto-detects when no path is configured
    pub fn open(mut config: CaptureConfig, leases: LeaseCounter) -> Result<Self> {
        if config.device.is_empty() {
            config.device = auto_detect_device()?;
        }
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Unknown(_) => return Err(eyre!("Unsupported pixel format")),
            known => FourCC::new(&known.fourcc()),
        };
        let fmt = device.set_format(&fmt)?;

        // The driver may settle on something other than what was asked for
        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr);
        info!(
            "Negotiated {}x{} {:?} (stride {})",
            fmt.width, fmt.height, format, fmt.stride
        );
        config.width = fmt.width;
        config.height = fmt.height;

        Ok(Self {
            stream: None,
            device: Box::new(device),
            stride: fmt.stride,
            config,
            format,
            sequencer: FrameSequencer::new(leases),
        })
    }

    /// Start streaming with memory-mapped buffers
    pub fn start_stream(&mut self) -> Result<()> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    #[instrument(skip(self), level = "trace")]
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.stream.is_none() {
            self.start_stream()
                .map_err(|e| CaptureError::Device(e.to_string()))?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Device("stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::Disconnected(e.to_string()))?;
        let timestamp = Instant::now();

        // Copy out of the mapped buffer; it is requeued on the next dequeue
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        let id = self.sequencer.next_id();
        let frame = Frame::new(id, self.config.width, self.config.height, self.format, data)
            .with_stride(self.stride)
            .with_timestamp(timestamp)
            .with_device_timestamp(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            )
            .with_lease(self.sequencer.lease());
        Ok(Some(frame))
    }

    fn name(&self) -> &str {
        &self.config.device
    }
}

/// Auto-detect the first capture device that speaks a format we decode
pub fn auto_detect_device() -> Result<String> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                let format = PixelFormat::from_fourcc(&fmt.fourcc.repr);
                if !matches!(format, PixelFormat::Unknown(_)) {
                    info!("Found {:?} device: {} - {}", format, path, caps.card);
                    return Ok(path);
                }
            }
        }
    }

    Err(eyre!("No suitable capture device found"))
}
