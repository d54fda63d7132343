//! Consumers of annotated frames

pub mod channel;
pub mod overlay;
pub mod logging;

pub use channel::ChannelSink;
pub use overlay::{OverlayFrame, OverlaySink};
pub use logging::TracingSink;

use crate::aggregate::Annotated;

/// One-way hand-off of a frame, its annotations and how long inference took.
///
/// The sink takes ownership of the frame; `publish` must not wait on
/// rendering or any other downstream work.
pub trait Sink: Send + 'static {
    fn publish(&mut self, annotated: Annotated);
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish(&mut self, annotated: Annotated) {
        (**self).publish(annotated)
    }
}
