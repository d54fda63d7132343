//! Renders annotation boxes onto an RGB copy of the frame

use std::time::Duration;

use flume::{Sender, TrySendError};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::{debug, warn};

use super::Sink;
use crate::aggregate::{Annotated, Annotation};
use crate::capture::FrameId;
use crate::preprocess::convert;

/// Palette cycled by class id
const PALETTE: [[u8; 3]; 6] = [
    [255, 64, 64],
    [64, 255, 64],
    [64, 128, 255],
    [255, 200, 0],
    [255, 0, 255],
    [0, 255, 255],
];

#[derive(Debug)]
pub struct OverlayFrame {
    pub id: FrameId,
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
    /// Inference time for the frame, for on-screen display
    pub inference_latency: Duration,
}

/// Draws each annotation as a hollow rectangle and forwards the image.
///
/// The source frame is released as soon as it has been converted.
pub struct OverlaySink {
    tx: Sender<OverlayFrame>,
}

impl OverlaySink {
    pub fn new(tx: Sender<OverlayFrame>) -> Self {
        Self { tx }
    }
}

/// Draw `annotations` onto `image` in place
pub fn draw_annotations(image: &mut RgbImage, annotations: &[Annotation]) {
    let (w, h) = image.dimensions();
    for ann in annotations {
        let r = &ann.region;
        let x = (r.x1.max(0.0) as u32).min(w.saturating_sub(1));
        let y = (r.y1.max(0.0) as u32).min(h.saturating_sub(1));
        let width = (r.width().round() as u32).clamp(1, w - x);
        let height = (r.height().round() as u32).clamp(1, h - y);
        let color = PALETTE[ann.class_id % PALETTE.len()];
        draw_hollow_rect_mut(
            image,
            Rect::at(x as i32, y as i32).of_size(width, height),
            Rgb(color),
        );
    }
}

impl Sink for OverlaySink {
    fn publish(&mut self, annotated: Annotated) {
        let Annotated {
            frame,
            annotations,
            inference_latency,
        } = annotated;
        let id = frame.id();
        let mut image = match convert::to_rgb(&frame) {
            Ok(image) => image,
            Err(e) => {
                warn!("overlay skipped frame {}: {}", id, e);
                return;
            }
        };
        drop(frame);

        draw_annotations(&mut image, &annotations);
        let overlay = OverlayFrame {
            id,
            image,
            annotations,
            inference_latency,
        };
        match self.tx.try_send(overlay) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("overlay consumer behind, dropped frame {}", id),
            Err(TrySendError::Disconnected(_)) => debug!("overlay consumer gone"),
        }
    }
}
