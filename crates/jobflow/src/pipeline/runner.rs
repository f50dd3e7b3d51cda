use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::definition::{PipelineDefinition, StageDefinition};
use super::error::StageError;
use super::stage::{StageContext, StageOutput};
use crate::error::StoreError;
use crate::job::{ErrorDetail, FailureKind, JobId, JobStatus, ResultRef, StageRecord, Transition};
use crate::store::JobStore;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ResultRef),
    Failed(ErrorDetail),
    Cancelled,
    /// The job was finalized elsewhere (forced cancel, job timeout) or was
    /// not runnable when the run started.
    Superseded(JobStatus),
}

enum StageResult {
    Done { output: StageOutput, attempts: u32 },
    Failed(ErrorDetail),
    Cancelled,
    Superseded,
}

/// Executes a pipeline's stages in order for one job, reporting every
/// step through the job store.
pub struct PipelineRunner {
    store: Arc<JobStore>,
}

impl PipelineRunner {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Runs all stages of `pipeline` for `job_id`.
    ///
    /// Stage failures become job state, not errors. `Err` means the store
    /// rejected a transition, which is a bug.
    pub async fn run(
        &self,
        job_id: &JobId,
        pipeline: &PipelineDefinition,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, StoreError> {
        let span = info_span!("pipeline", job_id = %job_id, pipeline = %pipeline.name());
        self.run_stages(job_id, pipeline, cancel).instrument(span).await
    }

    async fn run_stages(
        &self,
        job_id: &JobId,
        pipeline: &PipelineDefinition,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, StoreError> {
        let job = self.store.get(job_id)?;
        if job.status != JobStatus::Pending {
            debug!(status = %job.status, "Job is not pending, skipping run");
            return Ok(RunOutcome::Superseded(job.status));
        }

        let Some(first) = pipeline.stages().first() else {
            return Ok(RunOutcome::Superseded(job.status));
        };

        if cancel.is_cancelled() {
            return self.cancel_job(job_id, None).await;
        }

        let start = Transition::running()
            .progress(0.0)
            .stage(0, &first.name)
            .attempt(1)
            .message(format!("Starting stage '{}'", first.name));
        if self.store.transition_active(job_id, start)?.is_none() {
            return self.superseded(job_id);
        }
        info!("Pipeline started");

        let input = Arc::new(job.input);
        let mut prior: Option<Arc<serde_json::Value>> = None;
        let last_index = pipeline.len() - 1;

        for (index, stage) in pipeline.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                return self.cancel_job(job_id, Some(stage)).await;
            }

            let result = self
                .run_stage(job_id, index, stage, &input, prior.clone(), &cancel)
                .instrument(info_span!("stage", stage = %stage.name, index))
                .await?;

            let (output, attempts) = match result {
                StageResult::Done { output, attempts } => (output, attempts),
                StageResult::Failed(detail) => {
                    warn!(stage = %stage.name, "Stage failed: {}", detail);
                    return match self
                        .store
                        .transition_active(job_id, Transition::failed(detail.clone()))?
                    {
                        Some(_) => Ok(RunOutcome::Failed(detail)),
                        None => self.superseded(job_id),
                    };
                }
                StageResult::Cancelled => return self.cancel_job(job_id, Some(stage)).await,
                StageResult::Superseded => return self.superseded(job_id),
            };

            let record = StageRecord {
                name: stage.name.clone(),
                attempts,
                output: output.value.clone(),
                finished_at: Utc::now(),
            };

            if index == last_index {
                let result_ref = output
                    .result_ref
                    .clone()
                    .unwrap_or_else(|| ResultRef::new(format!("{}/{}", job_id, stage.name)));
                let done = Transition::completed(result_ref.clone())
                    .record(record)
                    .message(format!("Completed {} stage(s)", pipeline.len()));
                return match self.store.transition_active(job_id, done)? {
                    Some(_) => {
                        info!(result = %result_ref, "Pipeline completed");
                        Ok(RunOutcome::Completed(result_ref))
                    }
                    None => self.superseded(job_id),
                };
            }

            let next = &pipeline.stages()[index + 1];
            let advance = Transition::running()
                .progress(pipeline.cumulative_weight(index))
                .stage(index + 1, &next.name)
                .attempt(1)
                .record(record)
                .message(format!("Finished '{}', starting '{}'", stage.name, next.name));
            if self.store.transition_active(job_id, advance)?.is_none() {
                return self.superseded(job_id);
            }

            prior = Some(Arc::new(output.value));
        }

        self.superseded(job_id)
    }

    /// Runs one stage with its retry budget.
    async fn run_stage(
        &self,
        job_id: &JobId,
        index: usize,
        stage: &StageDefinition,
        input: &Arc<serde_json::Value>,
        prior: Option<Arc<serde_json::Value>>,
        cancel: &CancellationToken,
    ) -> Result<StageResult, StoreError> {
        let max_attempts = stage.retry.max_attempts();
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = stage.retry.delay_for_retry(attempt - 2);
                let reason = last_failure
                    .as_ref()
                    .map(|d: &ErrorDetail| d.message.clone())
                    .unwrap_or_default();
                let retry = Transition::running().attempt(attempt).message(format!(
                    "Retrying stage '{}' (attempt {}/{}): {}",
                    stage.name, attempt, max_attempts, reason
                ));
                if self.store.transition_active(job_id, retry)?.is_none() {
                    return Ok(StageResult::Superseded);
                }

                warn!(
                    attempt,
                    max = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error: {}",
                    reason
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(StageResult::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let ctx = StageContext::new(
                job_id.clone(),
                &stage.name,
                index,
                attempt,
                Arc::clone(input),
                prior.clone(),
                cancel.clone(),
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StageResult::Cancelled),
                result = tokio::time::timeout(stage.timeout, stage.stage.execute(ctx)) => result,
            };

            match result {
                Ok(Ok(output)) => {
                    debug!(attempt, "Stage finished");
                    return Ok(StageResult::Done {
                        output,
                        attempts: attempt,
                    });
                }
                Ok(Err(StageError::Cancelled)) => return Ok(StageResult::Cancelled),
                Ok(Err(err)) if !err.is_retryable() => {
                    return Ok(StageResult::Failed(
                        ErrorDetail::new(err.failure_kind(), err.to_string())
                            .at_stage(index, &stage.name, attempt),
                    ));
                }
                Ok(Err(err)) => {
                    last_failure = Some(
                        ErrorDetail::new(err.failure_kind(), err.to_string())
                            .at_stage(index, &stage.name, attempt),
                    );
                }
                Err(_elapsed) => {
                    warn!(attempt, timeout_ms = stage.timeout.as_millis() as u64, "Stage timed out");
                    last_failure = Some(
                        ErrorDetail::new(
                            FailureKind::StageTimeout,
                            format!("stage exceeded its {:?} timeout", stage.timeout),
                        )
                        .at_stage(index, &stage.name, attempt),
                    );
                }
            }
        }

        let detail = last_failure.unwrap_or_else(|| {
            ErrorDetail::new(FailureKind::Transient, "stage made no attempts")
                .at_stage(index, &stage.name, max_attempts)
        });
        Ok(StageResult::Failed(detail))
    }

    async fn cancel_job(
        &self,
        job_id: &JobId,
        stage: Option<&StageDefinition>,
    ) -> Result<RunOutcome, StoreError> {
        let message = match stage {
            Some(stage) => format!("Cancelled during stage '{}'", stage.name),
            None => "Cancelled before start".to_string(),
        };
        match self
            .store
            .transition_active(job_id, Transition::cancelled(message))?
        {
            Some(_) => {
                info!("Pipeline cancelled");
                Ok(RunOutcome::Cancelled)
            }
            None => self.superseded(job_id),
        }
    }

    fn superseded(&self, job_id: &JobId) -> Result<RunOutcome, StoreError> {
        let status = self.store.get(job_id)?.status;
        debug!(status = %status, "Job finalized outside the runner");
        Ok(RunOutcome::Superseded(status))
    }
}
