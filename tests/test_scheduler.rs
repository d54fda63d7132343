// Integration tests for the scheduler state machine and full pipeline runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{FixedModel, GatedModel};
use edgesight::capture::{CaptureError, Frame, FrameId, LeaseCounter, PixelFormat, ReplaySource};
use edgesight::inference::{InferenceEngine, Model};
use edgesight::pipeline::{
    Cycle, FrameBuffer, Pipeline, PipelineStats, Scheduler, SchedulerState, Wait,
};
use edgesight::aggregate::Annotated;
use edgesight::sink::ChannelSink;
use edgesight::{Config, DropReason, PipelineError};
use tokio::sync::watch;

struct Harness {
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
    leases: LeaseCounter,
    published: flume::Receiver<Annotated>,
    scheduler: Scheduler<ChannelSink>,
}

fn harness<M: Model>(model: M, config: &Config) -> Harness {
    let buffer = Arc::new(FrameBuffer::new(config.buffer.capacity, config.buffer.policy));
    let stats = Arc::new(PipelineStats::new());
    let leases = LeaseCounter::new();
    let engine = InferenceEngine::spawn(model, config.inference.deadline(), stats.clone()).unwrap();
    let (sink, published) = ChannelSink::bounded(64);
    let scheduler = Scheduler::new(buffer.clone(), engine, sink, stats.clone(), config).with_leases(leases.clone());
    Harness {
        buffer,
        stats,
        leases,
        published,
        scheduler,
    }
}

fn config_with_deadline(ms: u64) -> Config {
    let mut config = Config::default();
    config.inference.deadline_ms = ms;
    config.inference.shutdown_grace_ms = 50;
    config
}

#[tokio::test(start_paused = true)]
async fn timed_out_frame_is_dropped_without_publishing() {
    let (model, gate) = GatedModel::new();
    let mut h = harness(model, &config_with_deadline(10));
    let s = &mut h.scheduler;

    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::AwaitingFrame));
    assert_eq!(s.step().unwrap(), Cycle::Waiting(Wait::Frame));

    h.buffer.push(common::frame(1, &h.leases));
    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::Preprocessing));
    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::Inferring));
    gate.started.recv().unwrap();
    assert_eq!(s.step().unwrap(), Cycle::Waiting(Wait::Inference));

    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(
        s.step().unwrap(),
        Cycle::Dropped {
            frame_id: FrameId(1),
            reason: DropReason::Timeout,
        }
    );
    assert_eq!(s.state(), SchedulerState::AwaitingFrame);
    assert_eq!(h.stats.dropped(DropReason::Timeout), 1);

    // The runtime finishes at t=15; its result goes nowhere
    tokio::time::advance(Duration::from_millis(5)).await;
    gate.release.send(()).unwrap();
    assert_eq!(s.step().unwrap(), Cycle::Waiting(Wait::Frame));
    assert!(h.published.try_recv().is_err());
    assert_eq!(s.last_published(), None);

    drop(gate);
    s.shutdown().await;
    assert_eq!(common::settle(&h.leases), 0);
}

#[tokio::test(start_paused = true)]
async fn completed_inference_is_published() {
    let model = FixedModel::new(vec![[0.0, 0.0, 0.5, 0.5, 0.9, 0.0]]);
    let mut h = harness(model, &config_with_deadline(1_000));
    h.buffer.push(common::frame(1, &h.leases));

    let mut cycles = Vec::new();
    loop {
        let cycle = h.scheduler.step().unwrap();
        if let Cycle::Waiting(Wait::Inference) = cycle {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let done = matches!(cycle, Cycle::Published { .. });
        cycles.push(cycle);
        if done {
            break;
        }
    }
    assert_eq!(
        cycles.last(),
        Some(&Cycle::Published {
            frame_id: FrameId(1),
            annotations: 1,
        })
    );

    let out = h.published.try_recv().unwrap();
    assert_eq!(out.frame.id(), FrameId(1));
    assert_eq!(out.annotations[0].label, "thing");
    // The sink sees the same runtime latency the stats recorded
    assert_eq!(
        Some(out.inference_latency),
        h.stats.snapshot(Default::default()).mean_latency
    );
    assert_eq!(h.stats.published(), 1);
    assert_eq!(h.stats.last_published(), Some(FrameId(1)));

    drop(out);
    h.scheduler.shutdown().await;
    assert_eq!(common::settle(&h.leases), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_frame_is_dropped_and_the_cycle_continues() {
    let mut h = harness(FixedModel::new(vec![]), &config_with_deadline(1_000));
    let s = &mut h.scheduler;
    s.step().unwrap();

    let short = Frame::new(FrameId(1), 8, 8, PixelFormat::Rgb24, Bytes::from(vec![0u8; 5]))
        .with_lease(h.leases.acquire());
    h.buffer.push(short);
    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::Preprocessing));
    assert_eq!(
        s.step().unwrap(),
        Cycle::Dropped {
            frame_id: FrameId(1),
            reason: DropReason::ShapeMismatch,
        }
    );
    assert_eq!(s.state(), SchedulerState::AwaitingFrame);
    assert_eq!(h.leases.outstanding(), 0);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_frames_are_dropped_at_take() {
    let mut config = config_with_deadline(1_000);
    config.scheduler.max_staleness_ms = Some(5);
    let mut h = harness(FixedModel::new(vec![]), &config);
    let s = &mut h.scheduler;
    s.step().unwrap();

    h.buffer.push(common::frame(1, &h.leases));
    tokio::time::advance(Duration::from_millis(6)).await;
    assert_eq!(
        s.step().unwrap(),
        Cycle::Dropped {
            frame_id: FrameId(1),
            reason: DropReason::Stale,
        }
    );
    assert_eq!(h.leases.outstanding(), 0);
    s.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn target_rate_spaces_cycle_starts() {
    let mut config = config_with_deadline(1_000);
    config.scheduler.target_fps = Some(10.0);
    let mut h = harness(FixedModel::new(vec![]), &config);
    let s = &mut h.scheduler;
    s.step().unwrap();

    h.buffer.push(common::frame(1, &h.leases));
    let started = tokio::time::Instant::now();
    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::Preprocessing));
    // Run the first cycle to completion
    while s.state() != SchedulerState::AwaitingFrame {
        if let Cycle::Waiting(Wait::Inference) = s.step().unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    h.buffer.push(common::frame(2, &h.leases));
    assert_eq!(
        s.step().unwrap(),
        Cycle::Waiting(Wait::Pacing(started + Duration::from_millis(100)))
    );
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(s.step().unwrap(), Cycle::Advanced(SchedulerState::Preprocessing));
    s.shutdown().await;
}

// Real time: the scheduler must not race through the deadline while the
// test waits on the worker.
#[tokio::test]
async fn shutdown_mid_inference_releases_every_frame_and_tensor() {
    let (model, gate) = GatedModel::new();
    let h = harness(model, &config_with_deadline(1_000));
    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(h.scheduler.run(rx));

    h.buffer.push(common::frame(1, &h.leases));
    gate.started.recv_async().await.unwrap();
    // A second frame waits in the buffer while the first is inferring
    h.buffer.push(common::frame(2, &h.leases));
    assert_eq!(h.leases.outstanding(), 3);

    tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    assert!(h.buffer.is_empty());
    assert!(h.published.try_recv().is_err());

    // The abandoned call holds its tensor until the runtime returns
    drop(gate);
    assert_eq!(common::settle(&h.leases), 0);
}

#[tokio::test]
async fn published_frame_ids_strictly_increase() {
    let mut config = config_with_deadline(1_000);
    config.capture.idle_poll_ms = 1;
    let pipeline = Pipeline::new(config).unwrap();
    let leases = pipeline.leases();
    let stats = pipeline.stats();

    let frames: Vec<Frame> = (1..=40).map(|id| common::frame(id, &leases)).collect();
    let mut script: Vec<Option<Frame>> = Vec::new();
    for frame in frames {
        script.push(Some(frame));
        script.push(None);
    }
    let model = FixedModel::new(vec![[0.0, 0.0, 1.0, 1.0, 0.9, 0.0]]).with_latency(Duration::from_millis(3));
    let (sink, published) = ChannelSink::bounded(64);

    let outcome = pipeline.run(ReplaySource::from_script(script), model, sink).await;
    assert!(matches!(
        outcome,
        Err(PipelineError::CaptureUnavailable(CaptureError::Exhausted))
    ));

    let ids: Vec<u64> = published.drain().map(|p| p.frame.id().0).collect();
    assert!(!ids.is_empty());
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids out of order: {ids:?}");
    // The freshest frame is never starved
    assert_eq!(ids.last(), Some(&40));
    assert_eq!(stats.published(), ids.len() as u64);
    assert_eq!(common::settle(&leases), 0);
}
