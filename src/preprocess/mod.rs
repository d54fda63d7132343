//! Frame to model-input tensor: convert to RGB, resize, re-layout, normalize
//! and quantize.

pub mod convert;

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::instrument;

use crate::capture::{Frame, LeaseCounter, PixelFormat};
use crate::error::DropReason;
use crate::inference::InputSpec;
use crate::tensor::{ElementType, Tensor, TensorData, TensorLayout};

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unsupported pixel format {0:?}")]
    FormatUnsupported(PixelFormat),

    #[error("corrupt frame: {0}")]
    Corrupt(String),
}

impl PreprocessError {
    pub fn drop_reason(&self) -> DropReason {
        match self {
            PreprocessError::ShapeMismatch(_) => DropReason::ShapeMismatch,
            PreprocessError::FormatUnsupported(_) => DropReason::FormatUnsupported,
            PreprocessError::Corrupt(_) => DropReason::Corrupt,
        }
    }
}

const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Stateless transform from frames to the model's declared input.
///
/// Identical frames always produce bit-identical tensors.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    spec: InputSpec,
    leases: Option<LeaseCounter>,
}

impl Preprocessor {
    pub fn new(spec: InputSpec) -> Self {
        Self {
            spec,
            leases: None,
        }
    }

    /// Track produced tensors against `leases`
    pub fn with_leases(mut self, leases: LeaseCounter) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }

    #[instrument(skip_all, fields(frame = %frame.id()), level = "trace")]
    pub fn prepare(&self, frame: &Frame) -> Result<Tensor, PreprocessError> {
        let spec = &self.spec;
        if spec.width == 0 || spec.height == 0 || !matches!(spec.channels, 1 | 3) {
            return Err(PreprocessError::ShapeMismatch(format!(
                "cannot derive {}x{}x{} model input",
                spec.width, spec.height, spec.channels
            )));
        }

        let rgb = convert::to_rgb(frame)?;
        let (w, h) = (spec.width as u32, spec.height as u32);
        let resized = if rgb.dimensions() == (w, h) {
            rgb
        } else {
            imageops::resize(&rgb, w, h, RESIZE_FILTER)
        };

        let samples = self.arrange(resized.as_raw());
        let data = self.encode(&samples)?;

        let tensor = Tensor::new(spec.shape(), data);
        Ok(match &self.leases {
            Some(leases) => tensor.with_lease(leases.acquire()),
            None => tensor,
        })
    }

    /// Channel selection and layout, still as 8-bit samples
    fn arrange(&self, rgb: &[u8]) -> Vec<u8> {
        let spec = &self.spec;
        let pixels = spec.width * spec.height;

        let interleaved: Vec<u8> = if spec.channels == 1 {
            rgb.chunks_exact(3).map(luma).collect()
        } else {
            rgb.to_vec()
        };

        match (spec.layout, spec.channels) {
            (TensorLayout::Nhwc, _) | (_, 1) => interleaved,
            (TensorLayout::Nchw, c) => {
                let mut planar = vec![0u8; pixels * c];
                for (i, px) in interleaved.chunks_exact(c).enumerate() {
                    for (ch, &value) in px.iter().enumerate() {
                        planar[ch * pixels + i] = value;
                    }
                }
                planar
            }
        }
    }

    fn encode(&self, samples: &[u8]) -> Result<TensorData, PreprocessError> {
        let (lo, hi) = self.spec.range;
        let normalize = |p: u8| lo + (f32::from(p) / 255.0) * (hi - lo);

        Ok(match (self.spec.element, self.spec.quantization) {
            (ElementType::F32, _) => TensorData::F32(samples.iter().map(|&p| normalize(p)).collect()),
            (ElementType::U8, None) => TensorData::U8(samples.to_vec()),
            (ElementType::U8, Some(q)) => {
                TensorData::U8(samples.iter().map(|&p| q.quantize_u8(normalize(p))).collect())
            }
            (ElementType::I8, Some(q)) => {
                TensorData::I8(samples.iter().map(|&p| q.quantize_i8(normalize(p))).collect())
            }
            (ElementType::I8, None) => {
                return Err(PreprocessError::ShapeMismatch(
                    "int8 input declared without quantization".into(),
                ))
            }
        })
    }
}

fn luma(px: &[u8]) -> u8 {
    let (r, g, b) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
    ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8
}
