//! Cycle-by-cycle orchestration of buffer, preprocessing, inference and
//! publishing.
//!
//! Freshness wins over completeness: the scheduler never blocks capture, and
//! any frame that cannot make progress is dropped and counted instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use super::ringbuf::FrameBuffer;
use super::stats::PipelineStats;
use crate::aggregate::ResultAggregator;
use crate::capture::{Frame, FrameId, LeaseCounter};
use crate::error::{DropReason, PipelineError};
use crate::inference::{EngineError, InferenceEngine, InferenceHandle, InferencePoll, InferenceResult};
use crate::preprocess::Preprocessor;
use crate::sink::Sink;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    AwaitingFrame,
    Preprocessing,
    Inferring,
    Publishing,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::AwaitingFrame => "awaiting-frame",
            SchedulerState::Preprocessing => "preprocessing",
            SchedulerState::Inferring => "inferring",
            SchedulerState::Publishing => "publishing",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a stalled step is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Frame,
    Inference,
    /// Rate limit; next cycle may start at this instant
    Pacing(Instant),
}

/// Outcome of one `step`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    Advanced(SchedulerState),
    Waiting(Wait),
    Dropped { frame_id: FrameId, reason: DropReason },
    Published { frame_id: FrameId, annotations: usize },
    Stopped,
}

/// Timing knobs taken from [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub cycle_interval: Option<Duration>,
    pub max_staleness: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.inference.poll_interval(),
            cycle_interval: config.scheduler.cycle_interval(),
            max_staleness: config.scheduler.max_staleness(),
            shutdown_grace: config.inference.shutdown_grace(),
        }
    }
}

pub struct Scheduler<S: Sink> {
    state: SchedulerState,
    buffer: Arc<FrameBuffer>,
    preprocessor: Preprocessor,
    engine: Option<InferenceEngine>,
    aggregator: ResultAggregator,
    sink: S,
    stats: Arc<PipelineStats>,
    settings: SchedulerSettings,
    /// Frame owned by the current cycle
    current: Option<Frame>,
    pending: Option<InferenceHandle>,
    result: Option<InferenceResult>,
    next_cycle_at: Option<Instant>,
    last_published: Option<FrameId>,
}

impl<S: Sink> Scheduler<S> {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        engine: InferenceEngine,
        sink: S,
        stats: Arc<PipelineStats>,
        config: &Config,
    ) -> Self {
        let description = engine.description();
        let preprocessor = Preprocessor::new(description.input.clone());
        let aggregator = ResultAggregator::new(description.output.clone(), &config.decode);

        Self {
            state: SchedulerState::Idle,
            buffer,
            preprocessor,
            engine: Some(engine),
            aggregator,
            sink,
            stats,
            settings: SchedulerSettings::from_config(config),
            current: None,
            pending: None,
            result: None,
            next_cycle_at: None,
            last_published: None,
        }
    }

    /// Track prepared tensors against `leases`
    pub fn with_leases(mut self, leases: LeaseCounter) -> Self {
        self.preprocessor = self.preprocessor.with_leases(leases);
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn last_published(&self) -> Option<FrameId> {
        self.last_published
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Advance the state machine by at most one transition without waiting
    pub fn step(&mut self) -> Result<Cycle, PipelineError> {
        match self.state {
            SchedulerState::Idle => Ok(self.advance(SchedulerState::AwaitingFrame)),
            SchedulerState::AwaitingFrame => Ok(self.await_frame()),
            SchedulerState::Preprocessing => self.preprocess_and_submit(),
            SchedulerState::Inferring => self.poll_inference(),
            SchedulerState::Publishing => Ok(self.publish()),
            SchedulerState::Stopped => Ok(Cycle::Stopped),
        }
    }

    fn advance(&mut self, next: SchedulerState) -> Cycle {
        trace!("{} -> {}", self.state, next);
        self.state = next;
        Cycle::Advanced(next)
    }

    fn await_frame(&mut self) -> Cycle {
        let now = Instant::now();
        if let Some(at) = self.next_cycle_at {
            if now < at {
                return Cycle::Waiting(Wait::Pacing(at));
            }
        }

        let Some(frame) = self.buffer.try_take() else {
            if self.buffer.is_closed() {
                debug!("frame buffer closed and drained");
                self.state = SchedulerState::Stopped;
                return Cycle::Stopped;
            }
            return Cycle::Waiting(Wait::Frame);
        };

        if let Some(limit) = self.settings.max_staleness {
            let age = frame.age(now);
            if age > limit {
                let frame_id = frame.id();
                debug!("frame {} is {:?} old, over the {:?} limit", frame_id, age, limit);
                self.stats.record_drop(DropReason::Stale);
                return Cycle::Dropped {
                    frame_id,
                    reason: DropReason::Stale,
                };
            }
        }

        self.next_cycle_at = self.settings.cycle_interval.map(|interval| now + interval);
        self.current = Some(frame);
        self.advance(SchedulerState::Preprocessing)
    }

    fn preprocess_and_submit(&mut self) -> Result<Cycle, PipelineError> {
        let Some(frame) = self.current.as_ref() else {
            return Ok(self.advance(SchedulerState::AwaitingFrame));
        };
        let frame_id = frame.id();

        let tensor = match self.preprocessor.prepare(frame) {
            Ok(tensor) => tensor,
            Err(e) => {
                debug!("dropping frame {}: {}", frame_id, e);
                return Ok(self.drop_current(frame_id, e.drop_reason()));
            }
        };

        let engine = self.engine.as_mut().ok_or(PipelineError::EngineStopped)?;
        match engine.submit(tensor, frame_id) {
            Ok(handle) => {
                self.pending = Some(handle);
                Ok(self.advance(SchedulerState::Inferring))
            }
            Err(EngineError::Busy { in_flight }) => {
                warn!("engine still busy with frame {} when submitting {}", in_flight, frame_id);
                Err(PipelineError::EngineBusyViolation(frame_id))
            }
            Err(EngineError::Saturated) => {
                debug!("runtime still occupied by abandoned work, dropping frame {}", frame_id);
                Ok(self.drop_current(frame_id, DropReason::Timeout))
            }
            Err(EngineError::WorkerGone | EngineError::StaleHandle(_)) => Err(PipelineError::EngineStopped),
        }
    }

    fn poll_inference(&mut self) -> Result<Cycle, PipelineError> {
        let Some(handle) = self.pending else {
            return Ok(self.advance(SchedulerState::AwaitingFrame));
        };
        let frame_id = handle.frame_id();
        let engine = self.engine.as_mut().ok_or(PipelineError::EngineStopped)?;

        match engine.poll(&handle) {
            Ok(InferencePoll::NotReady) => Ok(Cycle::Waiting(Wait::Inference)),
            Ok(InferencePoll::Ready(result)) => {
                self.pending = None;
                self.result = Some(result);
                Ok(self.advance(SchedulerState::Publishing))
            }
            Ok(InferencePoll::TimedOut) => {
                self.pending = None;
                Ok(self.drop_current(frame_id, DropReason::Timeout))
            }
            Ok(InferencePoll::Failed(e)) => {
                self.pending = None;
                warn!("inference failed for frame {}: {}", frame_id, e);
                Ok(self.drop_current(frame_id, DropReason::InferenceFailed))
            }
            Err(e) => {
                self.pending = None;
                warn!("lost inference for frame {}: {}", frame_id, e);
                Err(PipelineError::EngineStopped)
            }
        }
    }

    fn publish(&mut self) -> Cycle {
        let (Some(result), Some(frame)) = (self.result.take(), self.current.take()) else {
            return self.advance(SchedulerState::AwaitingFrame);
        };
        let frame_id = frame.id();

        let annotated = match self.aggregator.attach(result, frame) {
            Ok(annotated) => annotated,
            Err(e) => {
                warn!("could not decode result for frame {}: {}", frame_id, e);
                return self.drop_current(frame_id, e.drop_reason());
            }
        };

        // Publication order follows frame id
        if self.last_published.is_some_and(|last| frame_id <= last) {
            warn!("frame {} is older than the last published result", frame_id);
            return self.drop_current(frame_id, DropReason::Stale);
        }

        let staleness = annotated.frame.age(Instant::now());
        let count = annotated.annotations.len();
        self.stats.record_published(frame_id, staleness);
        self.sink.publish(annotated);
        self.last_published = Some(frame_id);
        self.state = SchedulerState::AwaitingFrame;

        Cycle::Published {
            frame_id,
            annotations: count,
        }
    }

    /// Release whatever the current cycle holds and return to waiting
    fn drop_current(&mut self, frame_id: FrameId, reason: DropReason) -> Cycle {
        self.current = None;
        self.result = None;
        self.stats.record_drop(reason);
        self.state = SchedulerState::AwaitingFrame;
        Cycle::Dropped { frame_id, reason }
    }

    /// Drive cycles until `shutdown` flips to true, its sender goes away,
    /// the buffer is closed and drained, or an unrecoverable error occurs.
    /// Everything the scheduler holds is released before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        info!("Scheduler started");
        let outcome = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            match self.step() {
                Ok(Cycle::Waiting(wait)) => {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break Ok(());
                            }
                        }
                        _ = wait_on(&self.buffer, self.settings.poll_interval, wait) => {}
                    }
                }
                Ok(Cycle::Stopped) => break Ok(()),
                Ok(Cycle::Dropped { frame_id, reason }) => {
                    trace!("frame {} dropped: {}", frame_id, reason);
                }
                Ok(_) => {}
                Err(e) => break Err(e),
            }
            tokio::task::yield_now().await;
        };

        self.shutdown().await;
        outcome
    }

    /// Release the current frame, any pending result and every buffered
    /// frame, then stop the inference engine.
    pub async fn shutdown(&mut self) {
        if self.state != SchedulerState::Stopped {
            debug!("scheduler stopping from {}", self.state);
        }
        self.state = SchedulerState::Stopped;

        if let Some(frame) = self.current.take() {
            debug!("releasing frame {} held at shutdown", frame.id());
        }
        self.pending = None;
        self.result = None;
        self.buffer.close();
        let drained = self.buffer.drain();
        if drained > 0 {
            debug!("released {} buffered frame(s)", drained);
        }

        if let Some(engine) = self.engine.take() {
            let grace = self.settings.shutdown_grace;
            if !engine.shutdown().join(grace).await {
                warn!("inference worker did not stop within {:?}", grace);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn wait_on(buffer: &FrameBuffer, poll_interval: Duration, wait: Wait) {
    match wait {
        Wait::Frame => buffer.ready().await,
        Wait::Inference => time::sleep(poll_interval).await,
        Wait::Pacing(at) => time::sleep_until(at).await,
    }
}
