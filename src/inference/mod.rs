pub mod engine;
pub mod model;
pub mod synthetic;

pub use engine::{
    EngineError, InferenceEngine, InferenceHandle, InferencePoll, InferenceResult, WorkerJoin,
};
pub use model::{InputSpec, Model, ModelDescription, ModelError, OutputKind, OutputSpec};
pub use synthetic::BrightSpotDetector;
