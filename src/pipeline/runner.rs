//! Wires a source, a model and a sink into running capture, scheduler and
//! reporter units.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use super::ringbuf::FrameBuffer;
use super::scheduler::Scheduler;
use super::stats::{PipelineStats, StatsSnapshot};
use crate::capture::{CaptureError, FrameSource, LeaseCounter};
use crate::error::PipelineError;
use crate::inference::{InferenceEngine, Model};
use crate::sink::Sink;
use crate::Config;

/// Cloneable trigger for a running pipeline
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

pub struct Pipeline {
    config: Config,
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
    leases: LeaseCounter,
    shutdown: ShutdownHandle,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let buffer = Arc::new(FrameBuffer::new(config.buffer.capacity, config.buffer.policy));
        let (tx, _) = watch::channel(false);

        Ok(Self {
            config,
            buffer,
            stats: Arc::new(PipelineStats::new()),
            leases: LeaseCounter::new(),
            shutdown: ShutdownHandle(Arc::new(tx)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Ledger every frame and tensor of this pipeline should be tracked in
    pub fn leases(&self) -> LeaseCounter {
        self.leases.clone()
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    /// Run until shutdown is triggered, the source fails, or the engine stops.
    ///
    /// A source that runs dry closes the buffer; frames already captured are
    /// still processed before this returns `CaptureUnavailable`.
    pub async fn run<Src, M, S>(self, source: Src, model: M, sink: S) -> Result<StatsSnapshot, PipelineError>
    where
        Src: FrameSource,
        M: Model,
        S: Sink,
    {
        let Pipeline {
            config,
            buffer,
            stats,
            leases,
            shutdown,
        } = self;

        let engine = InferenceEngine::spawn(model, config.inference.deadline(), stats.clone())
            .map_err(PipelineError::ModelLoadFailed)?;
        info!(
            "Pipeline: buffer {} ({:?}), deadline {:?}, confidence {:.2}, overlap {:.2}",
            buffer.capacity(),
            buffer.policy(),
            config.inference.deadline(),
            config.decode.confidence_threshold,
            config.decode.overlap_threshold,
        );

        let scheduler = Scheduler::new(buffer.clone(), engine, sink, stats.clone(), &config).with_leases(leases);

        let mut capture = tokio::task::spawn_blocking({
            let buffer = buffer.clone();
            let shutdown = shutdown.0.subscribe();
            let idle = Duration::from_millis(config.capture.idle_poll_ms.max(1));
            move || capture_loop(source, &buffer, &shutdown, idle)
        });
        let mut scheduling = tokio::spawn(scheduler.run(shutdown.0.subscribe()));
        let reporter = tokio::spawn(report_loop(
            stats.clone(),
            buffer.clone(),
            Duration::from_millis(config.telemetry.report_interval_ms.max(1)),
            shutdown.0.subscribe(),
        ));

        let (captured, scheduled) = tokio::select! {
            captured = &mut capture => {
                // The buffer is closed; the scheduler drains it and stops
                let scheduled = (&mut scheduling).await;
                (captured, scheduled)
            }
            scheduled = &mut scheduling => {
                shutdown.trigger();
                let captured = (&mut capture).await;
                (captured, scheduled)
            }
        };
        shutdown.trigger();
        if let Err(e) = reporter.await {
            debug!("reporter task ended abnormally: {e}");
        }

        let snapshot = stats.snapshot(buffer.stats());
        info!("Pipeline finished: {}", snapshot);

        flatten(scheduled)??;
        flatten(captured)?.map_err(PipelineError::CaptureUnavailable)?;
        Ok(snapshot)
    }
}

fn flatten<T>(joined: Result<T, JoinError>) -> Result<T, PipelineError> {
    joined.map_err(|e| PipelineError::Task(e.to_string()))
}

/// Pull frames into the buffer until shutdown or a source error; always
/// closes the buffer on the way out.
fn capture_loop<Src: FrameSource>(
    mut source: Src,
    buffer: &FrameBuffer,
    shutdown: &watch::Receiver<bool>,
    idle: Duration,
) -> Result<(), CaptureError> {
    info!("Capture started from {}", source.name());
    let outcome = loop {
        if *shutdown.borrow() || buffer.is_closed() {
            break Ok(());
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                metrics::counter!("edgesight_frames_captured").increment(1);
                buffer.push(frame);
            }
            Ok(None) => thread::sleep(idle),
            Err(CaptureError::Exhausted) => {
                info!("{} exhausted", source.name());
                break Err(CaptureError::Exhausted);
            }
            Err(e) => {
                error!("Capture error from {}: {}", source.name(), e);
                break Err(e);
            }
        }
    };
    buffer.close();
    outcome
}

async fn report_loop(
    stats: Arc<PipelineStats>,
    buffer: Arc<FrameBuffer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick is immediate
    ticker.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snapshot = stats.snapshot(buffer.stats());
                metrics::gauge!("edgesight_backlog").set(snapshot.backlog as f64);
                metrics::gauge!("edgesight_drop_rate").set(snapshot.drop_rate());
                info!("{}", snapshot);
            }
        }
    }
}
