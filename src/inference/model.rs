//! Capability boundary to the model runtime

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{ElementType, Quantization, Tensor, TensorLayout};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("input tensor shape {actual:?} does not match model input {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inference failed: {0}")]
    Execution(String),
}

/// Declared model input, fixed for the lifetime of the loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub width: usize,
    pub height: usize,
    /// 1 (luma) or 3 (RGB)
    pub channels: usize,
    pub layout: TensorLayout,
    pub element: ElementType,
    /// Real-valued range pixels are normalized into before any quantization
    pub range: (f32, f32),
    pub quantization: Option<Quantization>,
}

impl InputSpec {
    /// Batch of one
    pub fn shape(&self) -> Vec<usize> {
        match self.layout {
            TensorLayout::Nhwc => vec![1, self.height, self.width, self.channels],
            TensorLayout::Nchw => vec![1, self.channels, self.height, self.width],
        }
    }

    pub fn element_count(&self) -> usize {
        self.width * self.height * self.channels
    }
}

/// How the raw output tensor is to be read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    /// One score per label
    Classifier { labels: Vec<String> },
    /// Rows of `(x1, y1, x2, y2, score, class)`, coordinates normalized to [0, 1]
    Detector { labels: Vec<String> },
}

impl OutputKind {
    pub fn labels(&self) -> &[String] {
        match self {
            OutputKind::Classifier { labels } | OutputKind::Detector { labels } => labels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub shape: Vec<usize>,
    pub element: ElementType,
    pub quantization: Option<Quantization>,
    pub kind: OutputKind,
}

pub const DETECTION_ROW: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    pub version: String,
    pub input: InputSpec,
    pub output: OutputSpec,
}

impl ModelDescription {
    /// Check the description is something the pipeline can drive
    pub fn validate(&self) -> Result<(), ModelError> {
        let input = &self.input;
        if input.width == 0 || input.height == 0 {
            return Err(ModelError::Load(format!(
                "model input must be non-empty, got {}x{}",
                input.width, input.height
            )));
        }
        if !matches!(input.channels, 1 | 3) {
            return Err(ModelError::Load(format!(
                "model input must have 1 or 3 channels, got {}",
                input.channels
            )));
        }
        if input.element == ElementType::I8 && input.quantization.is_none() {
            return Err(ModelError::Load(
                "int8 model input requires quantization parameters".into(),
            ));
        }
        let (lo, hi) = input.range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(ModelError::Load(format!("invalid input range ({lo}, {hi})")));
        }

        let output = &self.output;
        match &output.kind {
            OutputKind::Classifier { labels } => {
                let n: usize = output.shape.iter().product();
                if !labels.is_empty() && n != labels.len() {
                    return Err(ModelError::Load(format!(
                        "classifier output has {n} scores for {} labels",
                        labels.len()
                    )));
                }
            }
            OutputKind::Detector { .. } => {
                if output.shape.last().copied().unwrap_or(0) < DETECTION_ROW {
                    return Err(ModelError::Load(format!(
                        "detector rows need {DETECTION_ROW} values, output shape is {:?}",
                        output.shape
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An opaque loaded model.
///
/// `infer` may block for as long as the runtime takes; the engine runs it
/// off the scheduler and enforces its own deadline. The input tensor is
/// consumed by the call.
pub trait Model: Send + 'static {
    fn describe(&self) -> ModelDescription;

    fn infer(&mut self, input: Tensor) -> Result<Tensor, ModelError>;
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn describe(&self) -> ModelDescription {
        (**self).describe()
    }

    fn infer(&mut self, input: Tensor) -> Result<Tensor, ModelError> {
        (**self).infer(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> ModelDescription {
        ModelDescription {
            name: "probe".into(),
            version: "1".into(),
            input: InputSpec {
                width: 8,
                height: 4,
                channels: 3,
                layout: TensorLayout::Nchw,
                element: ElementType::F32,
                range: (0.0, 1.0),
                quantization: None,
            },
            output: OutputSpec {
                shape: vec![3],
                element: ElementType::F32,
                quantization: None,
                kind: OutputKind::Classifier {
                    labels: vec!["a".into(), "b".into(), "c".into()],
                },
            },
        }
    }

    #[test]
    fn input_shape_follows_layout() {
        let mut desc = description();
        assert_eq!(desc.input.shape(), vec![1, 3, 4, 8]);
        desc.input.layout = TensorLayout::Nhwc;
        assert_eq!(desc.input.shape(), vec![1, 4, 8, 3]);
    }

    #[test]
    fn label_count_must_match_classifier_output() {
        let mut desc = description();
        assert!(desc.validate().is_ok());
        desc.output.shape = vec![4];
        assert!(matches!(desc.validate(), Err(ModelError::Load(_))));
    }

    #[test]
    fn two_channel_input_is_rejected() {
        let mut desc = description();
        desc.input.channels = 2;
        assert!(desc.validate().is_err());
    }
}
