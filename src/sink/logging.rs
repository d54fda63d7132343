use tracing::{debug, info};

use super::Sink;
use crate::aggregate::Annotated;

/// Logs every publication; the default sink for headless runs
#[derive(Debug, Default)]
pub struct TracingSink {
    published: u64,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl Sink for TracingSink {
    fn publish(&mut self, annotated: Annotated) {
        self.published += 1;
        let Annotated {
            frame,
            annotations,
            inference_latency,
        } = annotated;
        let age = frame.age(tokio::time::Instant::now());
        match annotations.first() {
            Some(best) => info!(
                "frame {} ({:?} old): best {} after {:.1}ms inference, {} annotation(s)",
                frame.id(),
                age,
                best,
                inference_latency.as_secs_f64() * 1000.0,
                annotations.len(),
            ),
            None => debug!(
                "frame {} ({:?} old): nothing detected after {:.1}ms inference",
                frame.id(),
                age,
                inference_latency.as_secs_f64() * 1000.0
            ),
        }
    }
}
