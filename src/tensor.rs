//! Fixed-shape numeric buffers exchanged with the model runtime

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    U8,
    I8,
}

/// Affine fixed-point mapping: `real = scale * (q - zero_point)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: i32,
}

impl Quantization {
    pub fn quantize_i8(&self, real: f32) -> i8 {
        let q = (real / self.scale).round() as i32 + self.zero_point;
        q.clamp(i8::MIN as i32, i8::MAX as i32) as i8
    }

    pub fn quantize_u8(&self, real: f32) -> u8 {
        let q = (real / self.scale).round() as i32 + self.zero_point;
        q.clamp(0, u8::MAX as i32) as u8
    }

    pub fn dequantize(&self, q: i32) -> f32 {
        self.scale * (q - self.zero_point) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TensorLayout {
    /// Batch, height, width, channels
    #[default]
    Nhwc,
    /// Batch, channels, height, width
    Nchw,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
    I8(Vec<i8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::U8(_) => ElementType::U8,
            TensorData::I8(_) => ElementType::I8,
        }
    }

    /// Real values, applying `quant` to integer elements when present
    pub fn to_f32(&self, quant: Option<Quantization>) -> Vec<f32> {
        match (self, quant) {
            (TensorData::F32(v), _) => v.clone(),
            (TensorData::U8(v), Some(q)) => v.iter().map(|&x| q.dequantize(x as i32)).collect(),
            (TensorData::I8(v), Some(q)) => v.iter().map(|&x| q.dequantize(x as i32)).collect(),
            (TensorData::U8(v), None) => v.iter().map(|&x| x as f32 / 255.0).collect(),
            (TensorData::I8(v), None) => v.iter().map(|&x| x as f32).collect(),
        }
    }
}

/// Numeric buffer with a declared shape.
///
/// Input tensors are consumed by exactly one inference call.
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
    _lease: Lease,
}

impl Tensor {
    /// Panics if the element count does not match the shape
    pub fn new(shape: Vec<usize>, data: TensorData) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "tensor data does not fill shape {shape:?}"
        );
        Self {
            shape,
            data,
            _lease: Lease::untracked(),
        }
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self._lease = lease;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("element", &self.element_type())
            .finish()
    }
}
