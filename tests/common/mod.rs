// Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use edgesight::capture::{Frame, FrameId, LeaseCounter, PixelFormat};
use edgesight::inference::{InputSpec, Model, ModelDescription, ModelError, OutputKind, OutputSpec};
use edgesight::tensor::{ElementType, Tensor, TensorData, TensorLayout};

pub const MODEL_SIDE: usize = 4;

pub fn input_spec() -> InputSpec {
    InputSpec {
        width: MODEL_SIDE,
        height: MODEL_SIDE,
        channels: 3,
        layout: TensorLayout::Nhwc,
        element: ElementType::F32,
        range: (0.0, 1.0),
        quantization: None,
    }
}

pub fn detector_output(labels: &[&str]) -> OutputSpec {
    OutputSpec {
        shape: vec![1, 6],
        element: ElementType::F32,
        quantization: None,
        kind: OutputKind::Detector {
            labels: labels.iter().map(|l| l.to_string()).collect(),
        },
    }
}

pub fn description() -> ModelDescription {
    ModelDescription {
        name: "fixture".into(),
        version: "0".into(),
        input: input_spec(),
        output: detector_output(&["thing"]),
    }
}

/// Detector rows as a `[n, 6]` tensor
pub fn rows(rows: &[[f32; 6]]) -> Tensor {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::new(vec![rows.len(), 6], TensorData::F32(flat))
}

/// An 8x8 RGB frame tracked in `leases`
pub fn frame(id: u64, leases: &LeaseCounter) -> Frame {
    Frame::new(FrameId(id), 8, 8, PixelFormat::Rgb24, Bytes::from(vec![128u8; 8 * 8 * 3]))
        .with_lease(leases.acquire())
}

/// Always returns the same detections after an optional delay
pub struct FixedModel {
    pub output: Vec<[f32; 6]>,
    pub latency: Duration,
}

impl FixedModel {
    pub fn new(output: Vec<[f32; 6]>) -> Self {
        Self {
            output,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Model for FixedModel {
    fn describe(&self) -> ModelDescription {
        description()
    }

    fn infer(&mut self, input: Tensor) -> Result<Tensor, ModelError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        drop(input);
        Ok(rows(&self.output))
    }
}

/// Blocks every call until the test releases it (or drops the gate)
pub struct GatedModel {
    gate: flume::Receiver<()>,
    started: flume::Sender<()>,
}

pub struct Gate {
    pub release: flume::Sender<()>,
    pub started: flume::Receiver<()>,
}

impl GatedModel {
    pub fn new() -> (Self, Gate) {
        let (release, gate) = flume::unbounded();
        let (started_tx, started) = flume::unbounded();
        (
            Self {
                gate,
                started: started_tx,
            },
            Gate { release, started },
        )
    }
}

impl Model for GatedModel {
    fn describe(&self) -> ModelDescription {
        description()
    }

    fn infer(&mut self, input: Tensor) -> Result<Tensor, ModelError> {
        let _ = self.started.send(());
        // Hold the input like a runtime would until the call returns
        let _ = self.gate.recv();
        drop(input);
        Ok(rows(&[[0.1, 0.1, 0.9, 0.9, 0.9, 0.0]]))
    }
}

/// Wait, in real time, for worker threads to let go of their leases
pub fn settle(leases: &LeaseCounter) -> usize {
    for _ in 0..500 {
        if leases.outstanding() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    leases.outstanding()
}
