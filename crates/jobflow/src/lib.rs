pub mod artifacts;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod hub;
pub mod ingest;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod worker;

pub use artifacts::{Artifact, ArtifactRegistry, ArtifactStorage, FsArtifactStorage};
pub use config::{load_config, load_config_from_str, Config};
pub use dedup::DedupIndex;
pub use error::{
    ArtifactError, ConfigError, DedupError, JobflowError, Result, StoreError, WorkerError,
};
pub use fingerprint::Fingerprint;
pub use hub::{EventKind, EventSink, ProgressEvent, ProgressHub, Subscription};
pub use ingest::{IngestItem, IngestReport, IngestScheduler, IngestSource};
pub use job::{ErrorDetail, FailureKind, Job, JobId, JobStatus, ResultRef, Transition};
pub use orchestrator::{Health, HealthStatus, Orchestrator, RetryReport, SubmitOutcome};
pub use pipeline::{
    PipelineDefinition, PipelineRegistry, PipelineRunner, Stage, StageContext, StageError,
    StageOutput,
};
pub use store::{JobFilter, JobStats, JobStore};
pub use sweeper::{CleanupSweeper, SweepReport};
pub use worker::{BackpressurePolicy, CancelOutcome, WorkerPool};
