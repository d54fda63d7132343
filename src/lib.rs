pub mod aggregate;
pub mod capture;
pub mod error;
pub mod inference;
pub mod pipeline;
pub mod preprocess;
pub mod sink;
pub mod tensor;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameId, PixelFormat};
pub use error::{ConfigError, DropReason, PipelineError};
pub use pipeline::ringbuf::DropPolicy;

/// Running configuration, swapped atomically once the binary has loaded it
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "EDGESIGHT";

/// Slowest accepted cycle rate: one cycle every 1000 s
pub const MIN_TARGET_FPS: f64 = 0.001;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub buffer: BufferConfig,
    pub inference: InferenceConfig,
    pub decode: DecodeConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
    pub synthetic: SyntheticConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device path; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Back-off between polls when the source has no frame yet
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    pub policy: DropPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Per-submission deadline
    pub deadline_ms: u64,
    /// How often the scheduler polls an in-flight inference
    pub poll_interval_ms: u64,
    /// How long shutdown waits for the runtime to return an abandoned call
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub confidence_threshold: f32,
    pub overlap_threshold: f32,
    pub max_annotations: usize,
    /// Suppress overlapping regions across classes, not only within one class
    pub class_agnostic: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on inference cycles per second; unbounded when unset
    pub target_fps: Option<f64>,
    /// Frames older than this when taken from the buffer are dropped
    pub max_staleness_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub report_interval_ms: u64,
    pub log_filter: String,
}

/// Parameters for the built-in test pattern source and bright-spot detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub square_size: u32,
    /// Stop the source after this many frames
    pub frames: Option<u64>,
    pub model_width: u32,
    pub model_height: u32,
    pub model_latency_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            device: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Rgb24,
            buffer_count: 4,
            idle_poll_ms: 2,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            policy: DropPolicy::DropOldest,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 200,
            poll_interval_ms: 2,
            shutdown_grace_ms: 500,
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            overlap_threshold: 0.45,
            max_annotations: 100,
            class_agnostic: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 5_000,
            log_filter: "edgesight=info".into(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            square_size: 64,
            frames: None,
            model_width: 96,
            model_height: 96,
            model_latency_ms: 40,
        }
    }
}

impl InferenceConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl SchedulerConfig {
    /// Minimum spacing between cycle starts; `None` for rates `validate` rejects
    pub fn cycle_interval(&self) -> Option<Duration> {
        self.target_fps
            .and_then(|fps| Duration::try_from_secs_f64(1.0 / fps).ok())
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `EDGESIGHT_*` overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `EDGESIGHT_DECODE__CONFIDENCE_THRESHOLD=0.7`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option combinations the pipeline cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid(format!(
                "capture resolution must be non-zero, got {}x{}",
                self.capture.width, self.capture.height
            ));
        }
        if self.buffer.capacity == 0 {
            return invalid("buffer capacity must be at least 1".into());
        }
        if self.inference.deadline_ms == 0 {
            return invalid("inference deadline must be greater than zero".into());
        }
        for (name, value) in [
            ("confidence threshold", self.decode.confidence_threshold),
            ("overlap threshold", self.decode.overlap_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if let Some(fps) = self.scheduler.target_fps {
            if !fps.is_finite() || fps < MIN_TARGET_FPS {
                return invalid(format!(
                    "target cycle rate must be at least {MIN_TARGET_FPS} fps, got {fps}"
                ));
            }
        }
        if self.synthetic.model_width == 0 || self.synthetic.model_height == 0 {
            return invalid("synthetic model input must be non-zero".into());
        }
        Ok(())
    }
}
