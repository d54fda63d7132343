pub mod ringbuf;
pub mod runner;
pub mod scheduler;
pub mod stats;

pub use ringbuf::{BufferStats, DropPolicy, FrameBuffer, PushOutcome};
pub use runner::{Pipeline, ShutdownHandle};
pub use scheduler::{Cycle, Scheduler, SchedulerSettings, SchedulerState, Wait};
pub use stats::{PipelineStats, StatsSnapshot};
