use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::StageError;
use crate::job::{JobId, ResultRef};

/// A pluggable unit of work within a pipeline.
///
/// Implementations must be cancellation safe: the runner drops the future
/// as soon as the job is cancelled or times out.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError>;
}

/// What a stage sees of its job.
#[derive(Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub stage: String,
    pub stage_index: usize,
    /// 1-based.
    pub attempt: u32,
    /// The job's input descriptor.
    pub input: Arc<serde_json::Value>,
    /// Output of the previous stage, `None` for the first stage.
    pub prior: Option<Arc<serde_json::Value>>,
    cancel: CancellationToken,
}

impl StageContext {
    pub(crate) fn new(
        job_id: JobId,
        stage: &str,
        stage_index: usize,
        attempt: u32,
        input: Arc<serde_json::Value>,
        prior: Option<Arc<serde_json::Value>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            stage: stage.to_string(),
            stage_index,
            attempt,
            input,
            prior,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Err(StageError::Cancelled)` once the job has been cancelled.
    pub fn checkpoint(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Result of a successful stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub value: serde_json::Value,
    /// Declared result reference; the last stage's becomes the job result.
    pub result_ref: Option<ResultRef>,
}

impl StageOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            result_ref: None,
        }
    }

    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(ResultRef::new(result_ref));
        self
    }
}
