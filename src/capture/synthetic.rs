//! Test pattern source: a bright square sliding across a dark field

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{info, instrument};

use super::frame::{Frame, PixelFormat};
use super::lease::LeaseCounter;
use super::source::{CaptureError, FrameSequencer, FrameSource};
use crate::{CaptureConfig, SyntheticConfig};

const BACKGROUND: u8 = 16;
const FOREGROUND: u8 = 240;

pub struct SyntheticSource {
    width: u32,
    height: u32,
    square: u32,
    interval: Duration,
    next_due: Instant,
    limit: Option<u64>,
    sequencer: FrameSequencer,
}

impl SyntheticSource {
    pub fn new(capture: &CaptureConfig, synthetic: &SyntheticConfig, leases: LeaseCounter) -> Self {
        let square = synthetic
            .square_size
            .clamp(1, capture.width.min(capture.height));
        let interval = Duration::from_secs_f64(1.0 / f64::from(capture.fps.max(1)));
        info!(
            "Synthetic source {}x{} @ {} fps (square {}px)",
            capture.width, capture.height, capture.fps, square
        );

        Self {
            width: capture.width,
            height: capture.height,
            square,
            interval,
            next_due: Instant::now(),
            limit: synthetic.frames,
            sequencer: FrameSequencer::new(leases),
        }
    }

    /// Top-left corner of the square in frame `n`
    pub fn square_origin(&self, n: u64) -> (u32, u32) {
        let span_x = u64::from(self.width - self.square + 1);
        let span_y = u64::from(self.height - self.square + 1);
        let x = (n * 8) % span_x;
        let y = (n * 3) % span_y;
        (x as u32, y as u32)
    }

    pub fn square_size(&self) -> u32 {
        self.square
    }

    fn render(&self, n: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![BACKGROUND; w * h * 3];
        let (ox, oy) = self.square_origin(n);
        let (ox, oy, side) = (ox as usize, oy as usize, self.square as usize);
        for row in oy..oy + side {
            let start = (row * w + ox) * 3;
            pixels[start..start + side * 3].fill(FOREGROUND);
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    #[instrument(skip(self), level = "trace")]
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(limit) = self.limit {
            if self.sequencer.issued() >= limit {
                return Err(CaptureError::Exhausted);
            }
        }

        let now = Instant::now();
        if now < self.next_due {
            return Ok(None);
        }
        self.next_due = now + self.interval;

        let id = self.sequencer.next_id();
        let data = Bytes::from(self.render(id.0));
        let frame = Frame::new(id, self.width, self.height, PixelFormat::Rgb24, data)
            .with_timestamp(now)
            .with_lease(self.sequencer.lease());
        Ok(Some(frame))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(frames: Option<u64>) -> SyntheticSource {
        let capture = CaptureConfig {
            width: 32,
            height: 24,
            fps: 1_000,
            ..CaptureConfig::default()
        };
        let synthetic = SyntheticConfig {
            square_size: 8,
            frames,
            ..SyntheticConfig::default()
        };
        SyntheticSource::new(&capture, &synthetic, LeaseCounter::new())
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_and_tracked() {
        let mut src = source(None);
        let first = src.next_frame().unwrap().expect("first frame is due immediately");
        assert_eq!(first.id().0, 1);
        assert!(first.is_tracked());
        assert_eq!(first.data.len(), 32 * 24 * 3);
        assert!(src.next_frame().unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let second = src.next_frame().unwrap().expect("second frame after interval");
        assert_eq!(second.id().0, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn square_is_drawn_where_reported() {
        let mut src = source(None);
        let frame = src.next_frame().unwrap().unwrap();
        let (ox, oy) = src.square_origin(frame.id().0);
        let at = |x: u32, y: u32| frame.data[((y * 32 + x) * 3) as usize];
        assert_eq!(at(ox, oy), FOREGROUND);
        assert_eq!(at(ox + 7, oy + 7), FOREGROUND);
        assert_eq!(at((ox + 8) % 32, (oy + 8) % 24), BACKGROUND);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_exhausts_the_source() {
        let mut src = source(Some(1));
        assert!(src.next_frame().unwrap().is_some());
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(matches!(src.next_frame(), Err(CaptureError::Exhausted)));
    }
}
