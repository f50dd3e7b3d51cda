use chrono::Utc;

use super::record::{ErrorDetail, Job, ResultRef, StageRecord};
use super::status::JobStatus;

/// A requested change to a job, validated and applied by the store.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub stage: Option<(usize, String)>,
    pub attempt: Option<u32>,
    pub message: Option<String>,
    pub error: Option<ErrorDetail>,
    pub result: Option<ResultRef>,
    pub record: Option<StageRecord>,
}

impl Transition {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            stage: None,
            attempt: None,
            message: None,
            error: None,
            result: None,
            record: None,
        }
    }

    pub fn running() -> Self {
        Self::to(JobStatus::Running)
    }

    pub fn completed(result: ResultRef) -> Self {
        Self::to(JobStatus::Completed)
            .progress(100.0)
            .result(result)
    }

    pub fn failed(error: ErrorDetail) -> Self {
        let message = error.to_string();
        Self::to(JobStatus::Failed).error(error).message(message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::to(JobStatus::Cancelled).message(message)
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stage(mut self, index: usize, name: impl Into<String>) -> Self {
        self.stage = Some((index, name.into()));
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn result(mut self, result: ResultRef) -> Self {
        self.result = Some(result);
        self
    }

    pub fn record(mut self, record: StageRecord) -> Self {
        self.record = Some(record);
        self
    }

    /// Checks the move against the state machine and the job invariants.
    pub fn validate(&self, job: &Job) -> Result<(), String> {
        if !job.status.can_transition_to(self.status) {
            return Err(format!(
                "status change {} -> {} is not allowed",
                job.status, self.status
            ));
        }

        let progress = self.target_progress(job);
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(format!("progress {progress} is outside 0..=100"));
        }
        if progress < job.progress {
            return Err(format!(
                "progress regression from {} to {}",
                job.progress, progress
            ));
        }

        match self.status {
            JobStatus::Failed if self.error.is_none() => {
                return Err("failed transition requires an error detail".to_string());
            }
            JobStatus::Failed => {}
            _ if self.error.is_some() => {
                return Err(format!("error detail on non-failed status {}", self.status));
            }
            _ => {}
        }

        if self.status == JobStatus::Completed {
            if self.result.is_none() {
                return Err("completed transition requires a result reference".to_string());
            }
            if progress != 100.0 {
                return Err(format!("completed transition with progress {progress}"));
            }
        } else if self.result.is_some() {
            return Err(format!("result reference on status {}", self.status));
        }

        Ok(())
    }

    /// Applies an already validated transition.
    pub fn apply(self, job: &mut Job) {
        let now = Utc::now();
        job.progress = self.target_progress(job);
        job.status = self.status;
        if let Some((index, name)) = self.stage {
            job.current_stage = index;
            job.stage_name = Some(name);
        }
        if let Some(attempt) = self.attempt {
            job.attempt = attempt;
        }
        job.message = self
            .message
            .unwrap_or_else(|| default_message(self.status).to_string());
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(record) = self.record {
            job.stages.push(record);
        }
        job.updated_at = now;
        if self.status.is_terminal() {
            job.completed_at = Some(now);
        }
    }

    fn target_progress(&self, job: &Job) -> f64 {
        self.progress.unwrap_or(job.progress)
    }
}

fn default_message(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "Queued for processing",
        JobStatus::Running => "Processing",
        JobStatus::Completed => "Completed",
        JobStatus::Failed => "Failed",
        JobStatus::Cancelled => "Cancelled",
    }
}
