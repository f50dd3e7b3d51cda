//! Staged pipelines: stage plugins, pipeline definitions and the runner.

pub mod definition;
mod error;
mod registry;
mod retry;
mod runner;
mod stage;

pub use definition::{PipelineBuilder, PipelineDefinition, StageDefinition};
pub use error::{PipelineError, StageError};
pub use registry::{PipelineRegistry, StageCatalog};
pub use retry::RetryPolicy;
pub use runner::{PipelineRunner, RunOutcome};
pub use stage::{Stage, StageContext, StageOutput};
