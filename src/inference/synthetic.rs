//! Stand-in detector for the synthetic source: boxes the bright pixels.

use std::thread;
use std::time::Duration;

use super::model::{InputSpec, Model, ModelDescription, ModelError, OutputKind, OutputSpec};
use crate::tensor::{ElementType, Tensor, TensorData, TensorLayout};
use crate::SyntheticConfig;

pub const BRIGHT_SPOT: &str = "bright-spot";

/// Pixels whose mean channel value exceeds this count as bright
const BRIGHT: f32 = 0.6;

pub struct BrightSpotDetector {
    width: usize,
    height: usize,
    latency: Duration,
}

impl BrightSpotDetector {
    pub fn new(config: &SyntheticConfig) -> Self {
        Self {
            width: config.model_width.max(1) as usize,
            height: config.model_height.max(1) as usize,
            latency: Duration::from_millis(config.model_latency_ms),
        }
    }

    /// Simulated runtime cost per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec {
            width: self.width,
            height: self.height,
            channels: 3,
            layout: TensorLayout::Nhwc,
            element: ElementType::F32,
            range: (0.0, 1.0),
            quantization: None,
        }
    }
}

impl Model for BrightSpotDetector {
    fn describe(&self) -> ModelDescription {
        ModelDescription {
            name: "bright-spot-detector".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            input: self.input_spec(),
            output: OutputSpec {
                shape: vec![1, 6],
                element: ElementType::F32,
                quantization: None,
                kind: OutputKind::Detector {
                    labels: vec![BRIGHT_SPOT.into()],
                },
            },
        }
    }

    fn infer(&mut self, input: Tensor) -> Result<Tensor, ModelError> {
        let expected = self.input_spec().shape();
        if input.shape() != expected.as_slice() {
            return Err(ModelError::InputShape {
                expected,
                actual: input.shape().to_vec(),
            });
        }
        let TensorData::F32(pixels) = input.data() else {
            return Err(ModelError::Execution(format!(
                "expected f32 input, got {:?}",
                input.element_type()
            )));
        };

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let (w, h) = (self.width, self.height);
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        let mut brightness = 0.0f32;
        let mut count = 0usize;

        for (i, px) in pixels.chunks_exact(3).enumerate() {
            let level = (px[0] + px[1] + px[2]) / 3.0;
            if level <= BRIGHT {
                continue;
            }
            let (x, y) = (i % w, i / w);
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
            });
            brightness += level;
            count += 1;
        }

        let rows = match bounds {
            None => Tensor::new(vec![0, 6], TensorData::F32(Vec::new())),
            Some((x1, y1, x2, y2)) => {
                let score = (brightness / count as f32).clamp(0.0, 1.0);
                let row = vec![
                    x1 as f32 / w as f32,
                    y1 as f32 / h as f32,
                    (x2 + 1) as f32 / w as f32,
                    (y2 + 1) as f32 / h as f32,
                    score,
                    0.0,
                ];
                Tensor::new(vec![1, 6], TensorData::F32(row))
            }
        };
        Ok(rows)
    }
}
