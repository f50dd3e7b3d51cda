use thiserror::Error;

use crate::job::FailureKind;

/// Failure reported by a stage implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Infrastructure failure worth retrying (rate limit, network, ...).
    #[error("{0}")]
    Transient(String),

    /// The input cannot be processed; retrying will not help.
    #[error("{0}")]
    Permanent(String),

    /// The stage observed cancellation at a checkpoint.
    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        StageError::Transient(message.to_string())
    }

    pub fn permanent(message: impl std::fmt::Display) -> Self {
        StageError::Permanent(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub(crate) fn failure_kind(&self) -> FailureKind {
        match self {
            StageError::Permanent(_) => FailureKind::Permanent,
            StageError::Transient(_) | StageError::Cancelled => FailureKind::Transient,
        }
    }
}

/// Invalid pipeline definition.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline '{0}' has no stages")]
    Empty(String),

    #[error("Pipeline '{pipeline}' defines stage '{stage}' more than once")]
    DuplicateStage { pipeline: String, stage: String },

    #[error("Stage '{stage}' in pipeline '{pipeline}' has invalid weight {weight}")]
    InvalidWeight {
        pipeline: String,
        stage: String,
        weight: f64,
    },

    #[error("Stage weights of pipeline '{pipeline}' sum to {total}, expected 100")]
    WeightSum { pipeline: String, total: f64 },

    #[error("Stage '{stage}' in pipeline '{pipeline}': {reason}")]
    InvalidStage {
        pipeline: String,
        stage: String,
        reason: String,
    },

    #[error("No implementation registered for stage '{stage}' of pipeline '{pipeline}'")]
    MissingStage { pipeline: String, stage: String },

    #[error("Pipeline '{0}' is already registered")]
    AlreadyRegistered(String),
}
