//! Single-in-flight inference with a per-submission deadline.
//!
//! The model runs on a dedicated worker thread. Submission and polling never
//! block the caller. The worker times every call itself, so a result that
//! arrives after its deadline is reported as timed out even when the caller
//! polls late. A submission that outlives its deadline is abandoned: the
//! engine frees its slot immediately, refuses new work until the runtime has
//! returned from the abandoned call, and discards that call's result by
//! ticket mismatch.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{self as stdtime, Duration};

use flume::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::{Model, ModelDescription, ModelError};
use crate::capture::FrameId;
use crate::pipeline::stats::PipelineStats;
use crate::tensor::Tensor;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A submission is already in flight
    #[error("inference engine busy with frame {in_flight}")]
    Busy { in_flight: FrameId },

    /// The runtime is still working through abandoned calls
    #[error("inference runtime still occupied by abandoned work")]
    Saturated,

    #[error("no in-flight inference matches the handle for frame {0}")]
    StaleHandle(FrameId),

    #[error("inference worker stopped")]
    WorkerGone,
}

/// Ticket for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceHandle {
    ticket: u64,
    frame_id: FrameId,
}

impl InferenceHandle {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

/// Raw model output for one frame
#[derive(Debug)]
pub struct InferenceResult {
    /// Back-reference to the frame the input was prepared from
    pub frame_id: FrameId,
    pub output: Tensor,
    pub started_at: Instant,
    pub finished_at: Instant,
}

impl InferenceResult {
    pub fn latency(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }
}

#[derive(Debug)]
pub enum InferencePoll {
    NotReady,
    Ready(InferenceResult),
    TimedOut,
    /// The runtime returned an error for this call
    Failed(ModelError),
}

struct Job {
    ticket: u64,
    frame_id: FrameId,
    input: Tensor,
}

struct Completion {
    ticket: u64,
    frame_id: FrameId,
    /// Time the runtime spent inside `infer`
    elapsed: Duration,
    outcome: Result<Tensor, ModelError>,
}

struct InFlight {
    handle: InferenceHandle,
    started_at: Instant,
    deadline: Instant,
}

pub struct InferenceEngine {
    jobs: Sender<Job>,
    completions: Receiver<Completion>,
    worker: Option<JoinHandle<()>>,
    description: ModelDescription,
    deadline: Duration,
    in_flight: Option<InFlight>,
    /// Ticket of a timed-out call the runtime has not returned from yet
    abandoned: Option<u64>,
    next_ticket: u64,
    stats: Arc<PipelineStats>,
}

impl InferenceEngine {
    /// Describe and validate the model, then move it onto its worker thread
    pub fn spawn<M: Model>(
        model: M,
        deadline: Duration,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, ModelError> {
        let description = model.describe();
        description.validate()?;
        info!(
            "Loaded model {} v{}: input {:?} {:?}, output {:?} {:?}",
            description.name,
            description.version,
            description.input.shape(),
            description.input.element,
            description.output.shape,
            description.output.element,
        );
        info!("Labels: {}", description.output.kind.labels().join(", "));

        // Submissions only go out while the worker is idle, so the slot is
        // never occupied for long.
        let (jobs, job_rx) = flume::bounded::<Job>(1);
        let (done_tx, completions) = flume::unbounded::<Completion>();
        let worker = thread::Builder::new()
            .name("edgesight-infer".into())
            .spawn(move || run_worker(model, job_rx, done_tx))
            .map_err(|e| ModelError::Load(format!("failed to start inference worker: {e}")))?;

        Ok(Self {
            jobs,
            completions,
            worker: Some(worker),
            description,
            deadline,
            in_flight: None,
            abandoned: None,
            next_ticket: 0,
            stats,
        })
    }

    pub fn description(&self) -> &ModelDescription {
        &self.description
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Hand `input` to the runtime; rejected, never queued, while busy or
    /// while the runtime is still inside an abandoned call
    pub fn submit(&mut self, input: Tensor, frame_id: FrameId) -> Result<InferenceHandle, EngineError> {
        if let Some(current) = &self.in_flight {
            return Err(EngineError::Busy {
                in_flight: current.handle.frame_id,
            });
        }
        self.take_completion(None)?;
        if self.abandoned.is_some() {
            return Err(EngineError::Saturated);
        }

        self.next_ticket += 1;
        let handle = InferenceHandle {
            ticket: self.next_ticket,
            frame_id,
        };
        let job = Job {
            ticket: handle.ticket,
            frame_id,
            input,
        };

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(EngineError::Saturated),
            Err(TrySendError::Disconnected(_)) => return Err(EngineError::WorkerGone),
        }

        let started_at = Instant::now();
        self.in_flight = Some(InFlight {
            handle,
            started_at,
            deadline: started_at + self.deadline,
        });
        self.stats.record_submitted();
        Ok(handle)
    }

    /// Check on a submission without waiting
    pub fn poll(&mut self, handle: &InferenceHandle) -> Result<InferencePoll, EngineError> {
        let Some(current) = self.in_flight.as_ref() else {
            return Err(EngineError::StaleHandle(handle.frame_id));
        };
        if current.handle != *handle {
            return Err(EngineError::StaleHandle(handle.frame_id));
        }
        let (started_at, deadline) = (current.started_at, current.deadline);

        let done = match self.take_completion(Some(handle.ticket)) {
            Ok(done) => done,
            Err(e) => {
                self.in_flight = None;
                return Err(e);
            }
        };
        if let Some(done) = done {
            self.in_flight = None;
            if done.elapsed >= self.deadline {
                warn!(
                    "inference for frame {} took {:?}, over the {:?} deadline",
                    handle.frame_id, done.elapsed, self.deadline
                );
                return Ok(InferencePoll::TimedOut);
            }
            self.stats.record_inference(done.elapsed);
            return Ok(match done.outcome {
                Ok(output) => InferencePoll::Ready(InferenceResult {
                    frame_id: done.frame_id,
                    output,
                    started_at,
                    finished_at: started_at + done.elapsed,
                }),
                Err(err) => InferencePoll::Failed(err),
            });
        }

        if Instant::now() >= deadline {
            self.in_flight = None;
            self.abandoned = Some(handle.ticket);
            warn!(
                "inference for frame {} exceeded {:?}; abandoning",
                handle.frame_id, self.deadline
            );
            return Ok(InferencePoll::TimedOut);
        }
        Ok(InferencePoll::NotReady)
    }

    /// Pull finished calls off the worker, returning the one for `ticket`.
    /// Anything else is a late result of an abandoned call and is dropped.
    fn take_completion(&mut self, ticket: Option<u64>) -> Result<Option<Completion>, EngineError> {
        loop {
            match self.completions.try_recv() {
                Ok(done) if Some(done.ticket) == ticket => return Ok(Some(done)),
                Ok(late) => {
                    if self.abandoned == Some(late.ticket) {
                        self.abandoned = None;
                    }
                    debug!(
                        "discarding late result for abandoned frame {} ({:?})",
                        late.frame_id, late.elapsed
                    );
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(EngineError::WorkerGone),
            }
        }
    }

    /// Abandon any in-flight call and let the worker exit once the runtime
    /// returns. The input tensor of an abandoned call is released when the
    /// runtime finishes with it.
    pub fn shutdown(self) -> WorkerJoin {
        let InferenceEngine {
            jobs,
            worker,
            in_flight,
            ..
        } = self;
        if let Some(current) = in_flight {
            debug!("abandoning inference for frame {} at shutdown", current.handle.frame_id);
        }
        drop(jobs);
        WorkerJoin { worker }
    }
}

/// Outstanding worker thread after shutdown
pub struct WorkerJoin {
    worker: Option<JoinHandle<()>>,
}

impl WorkerJoin {
    /// Wait up to `grace` for the worker to exit; false if it is still busy
    pub async fn join(self, grace: Duration) -> bool {
        let Some(worker) = self.worker else {
            return true;
        };
        let waiter = tokio::task::spawn_blocking(move || worker.join());
        match tokio::time::timeout(grace, waiter).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(_))) => {
                warn!("inference worker panicked");
                true
            }
            Ok(Err(err)) => {
                warn!("failed to join inference worker: {err}");
                false
            }
            Err(_) => {
                warn!("inference runtime still busy after {:?}; detaching worker", grace);
                false
            }
        }
    }

    /// Block until the worker exits
    pub fn join_blocking(self) {
        if let Some(worker) = self.worker {
            if worker.join().is_err() {
                warn!("inference worker panicked");
            }
        }
    }
}

fn run_worker<M: Model>(mut model: M, jobs: Receiver<Job>, done: Sender<Completion>) {
    while let Ok(job) = jobs.recv() {
        let begun = stdtime::Instant::now();
        let outcome = model.infer(job.input);
        let completion = Completion {
            ticket: job.ticket,
            frame_id: job.frame_id,
            elapsed: begun.elapsed(),
            outcome,
        };
        if done.send(completion).is_err() {
            break;
        }
    }
    debug!("inference worker exiting");
}
