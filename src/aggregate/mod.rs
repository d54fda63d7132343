//! Decoding raw model output into annotations and pairing them with their frame

mod annotation;
mod suppress;

use std::cmp::Ordering;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

pub use annotation::{Annotation, Region};
pub use suppress::suppress;

use crate::capture::{Frame, FrameId};
use crate::error::DropReason;
use crate::inference::model::DETECTION_ROW;
use crate::inference::{InferenceResult, OutputKind, OutputSpec};
use crate::tensor::Tensor;
use crate::DecodeConfig;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("result for frame {result} paired with frame {frame}")]
    FrameMismatch { result: FrameId, frame: FrameId },

    #[error("unexpected output shape {shape:?}: {reason}")]
    OutputShape { shape: Vec<usize>, reason: String },
}

impl AggregateError {
    pub fn drop_reason(&self) -> DropReason {
        match self {
            AggregateError::FrameMismatch { .. } => DropReason::InferenceFailed,
            AggregateError::OutputShape { .. } => DropReason::ShapeMismatch,
        }
    }
}

/// A frame with everything derived from it, ready for a sink
#[derive(Debug)]
pub struct Annotated {
    pub frame: Frame,
    pub annotations: Vec<Annotation>,
    /// Time the runtime spent on this frame's input
    pub inference_latency: Duration,
}

/// Deterministic decoder for one model's output convention
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    output: OutputSpec,
    confidence: f32,
    overlap: f32,
    max_annotations: usize,
    class_agnostic: bool,
}

impl ResultAggregator {
    pub fn new(output: OutputSpec, decode: &DecodeConfig) -> Self {
        Self {
            output,
            confidence: decode.confidence_threshold,
            overlap: decode.overlap_threshold,
            max_annotations: decode.max_annotations,
            class_agnostic: decode.class_agnostic,
        }
    }

    /// Pair `result` with the frame it was computed from
    pub fn attach(&self, result: InferenceResult, frame: Frame) -> Result<Annotated, AggregateError> {
        if result.frame_id != frame.id() {
            return Err(AggregateError::FrameMismatch {
                result: result.frame_id,
                frame: frame.id(),
            });
        }
        let inference_latency = result.latency();
        let annotations = self.decode(&result.output, frame.meta.width, frame.meta.height)?;
        trace!("frame {}: {} annotations", frame.id(), annotations.len());
        Ok(Annotated {
            frame,
            annotations,
            inference_latency,
        })
    }

    /// Annotations for a `width` x `height` frame, highest confidence first
    pub fn decode(&self, output: &Tensor, width: u32, height: u32) -> Result<Vec<Annotation>, AggregateError> {
        let values = output.data().to_f32(self.output.quantization);
        let mut annotations = match &self.output.kind {
            OutputKind::Classifier { labels } => {
                self.decode_scores(output.shape(), &values, labels, width, height)?
            }
            OutputKind::Detector { labels } => {
                let rows = self.decode_rows(output.shape(), &values, labels, width, height)?;
                suppress(rows, self.overlap, self.class_agnostic)
            }
        };
        annotations.truncate(self.max_annotations);
        Ok(annotations)
    }

    fn decode_scores(
        &self,
        shape: &[usize],
        scores: &[f32],
        labels: &[String],
        width: u32,
        height: u32,
    ) -> Result<Vec<Annotation>, AggregateError> {
        if !matches!(shape, [_] | [1, _]) {
            return Err(shape_error(shape, "classifier output must be [n] or [1, n]"));
        }
        if !labels.is_empty() && scores.len() != labels.len() {
            return Err(shape_error(
                shape,
                &format!("{} scores for {} labels", scores.len(), labels.len()),
            ));
        }

        let mut annotations: Vec<Annotation> = scores
            .iter()
            .enumerate()
            .filter(|(_, &score)| score.is_finite() && score >= self.confidence)
            .map(|(class_id, &score)| Annotation {
                label: label_for(labels, class_id),
                class_id,
                score: score.clamp(0.0, 1.0),
                region: Region::full(width, height),
            })
            .collect();
        annotations.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        Ok(annotations)
    }

    fn decode_rows(
        &self,
        shape: &[usize],
        values: &[f32],
        labels: &[String],
        width: u32,
        height: u32,
    ) -> Result<Vec<Annotation>, AggregateError> {
        let row_len = match shape {
            [_, k] | [1, _, k] => *k,
            _ => return Err(shape_error(shape, "detector output must be [n, k] or [1, n, k]")),
        };
        if row_len < DETECTION_ROW {
            return Err(shape_error(
                shape,
                &format!("detector rows need at least {DETECTION_ROW} values"),
            ));
        }

        let (w, h) = (width as f32, height as f32);
        let mut annotations = Vec::new();
        for row in values.chunks_exact(row_len) {
            let score = row[4];
            if !score.is_finite() || score < self.confidence {
                continue;
            }
            let class = row[5];
            if !class.is_finite() || class < 0.0 {
                trace!("skipping detection with class {class}");
                continue;
            }
            let class_id = class.round() as usize;
            let scale = |v: f32, extent: f32| v.clamp(0.0, 1.0) * extent;
            annotations.push(Annotation {
                label: label_for(labels, class_id),
                class_id,
                score: score.clamp(0.0, 1.0),
                region: Region::new(scale(row[0], w), scale(row[1], h), scale(row[2], w), scale(row[3], h)),
            });
        }
        Ok(annotations)
    }
}

fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class-{class_id}"))
}

fn shape_error(shape: &[usize], reason: &str) -> AggregateError {
    AggregateError::OutputShape {
        shape: shape.to_vec(),
        reason: reason.to_string(),
    }
}
