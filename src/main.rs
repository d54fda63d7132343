//! EdgeSight: camera to inference to annotations, with bounded latency

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edgesight::capture::{CaptureError, SyntheticSource};
use edgesight::inference::BrightSpotDetector;
use edgesight::pipeline::Pipeline;
use edgesight::sink::TracingSink;
use edgesight::{Config, DropPolicy, PipelineError, SourceKind};

#[derive(Debug, Parser)]
#[command(name = "edgesight", version, about)]
struct Cli {
    /// TOML configuration file; `EDGESIGHT_*` variables override it
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Frame source
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// V4L2 device path; auto-detected when empty
    #[arg(long, value_name = "PATH")]
    device: Option<String>,

    /// Stop the synthetic source after this many frames
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Per-inference deadline
    #[arg(long, value_name = "MS")]
    deadline_ms: Option<u64>,

    /// Minimum annotation confidence
    #[arg(long, value_name = "0..1")]
    confidence: Option<f32>,

    /// Overlap ratio above which duplicate detections are suppressed
    #[arg(long, value_name = "0..1")]
    overlap: Option<f32>,

    /// Frame buffer drop policy
    #[arg(long, value_enum)]
    policy: Option<DropPolicy>,

    /// Target cycle rate
    #[arg(long, value_name = "FPS")]
    target_fps: Option<f64>,

    /// Simulated latency of the synthetic model
    #[arg(long, value_name = "MS")]
    model_latency_ms: Option<u64>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(source) = self.source {
            config.capture.source = source;
        }
        if let Some(device) = self.device {
            config.capture.device = device;
        }
        if self.frames.is_some() {
            config.synthetic.frames = self.frames;
        }
        if let Some(ms) = self.deadline_ms {
            config.inference.deadline_ms = ms;
        }
        if let Some(c) = self.confidence {
            config.decode.confidence_threshold = c;
        }
        if let Some(o) = self.overlap {
            config.decode.overlap_threshold = o;
        }
        if let Some(policy) = self.policy {
            config.buffer.policy = policy;
        }
        if self.target_fps.is_some() {
            config.scheduler.target_fps = self.target_fps;
        }
        if let Some(ms) = self.model_latency_ms {
            config.synthetic.model_latency_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("EdgeSight launching...");
    edgesight::CONFIG.store(Arc::new(config.clone()));

    let pipeline = Pipeline::new(config.clone())?;
    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.trigger();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    let model = BrightSpotDetector::new(&config.synthetic);
    let sink = TracingSink::new();
    let outcome = match config.capture.source {
        SourceKind::Synthetic => {
            let source = SyntheticSource::new(&config.capture, &config.synthetic, pipeline.leases());
            pipeline.run(source, model, sink).await
        }
        SourceKind::V4l2 => run_v4l2(pipeline, &config, model, sink).await,
    };

    match outcome {
        Ok(snapshot) => info!("Stopped: {}", snapshot),
        Err(PipelineError::CaptureUnavailable(CaptureError::Exhausted)) => info!("Source exhausted"),
        Err(e) => return Err(e.into()),
    }

    info!("EdgeSight shutting down");
    Ok(())
}

#[cfg(feature = "v4l2")]
async fn run_v4l2(
    pipeline: Pipeline,
    config: &Config,
    model: BrightSpotDetector,
    sink: TracingSink,
) -> std::result::Result<edgesight::pipeline::StatsSnapshot, PipelineError> {
    use edgesight::capture::V4l2Source;

    let mut source = V4l2Source::open(config.capture.clone(), pipeline.leases())
        .map_err(|e| PipelineError::CaptureUnavailable(CaptureError::Device(e.to_string())))?;
    source
        .start_stream()
        .map_err(|e| PipelineError::CaptureUnavailable(CaptureError::Device(e.to_string())))?;
    pipeline.run(source, model, sink).await
}

#[cfg(not(feature = "v4l2"))]
async fn run_v4l2(
    _pipeline: Pipeline,
    _config: &Config,
    _model: BrightSpotDetector,
    _sink: TracingSink,
) -> std::result::Result<edgesight::pipeline::StatsSnapshot, PipelineError> {
    Err(PipelineError::CaptureUnavailable(CaptureError::Device(
        "built without the `v4l2` feature".into(),
    )))
}
