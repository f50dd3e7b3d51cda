use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ErrorDetail, Job, JobId, JobStatus, ResultRef};

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Completed | EventKind::Failed | EventKind::Cancelled
        )
    }

    /// Kind of the event describing a job that just reached `status`.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => EventKind::Created,
            JobStatus::Running => EventKind::Progress,
            JobStatus::Completed => EventKind::Completed,
            JobStatus::Failed => EventKind::Failed,
            JobStatus::Cancelled => EventKind::Cancelled,
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Unique job identifier.
    pub job_id: JobId,
    pub kind: EventKind,
    pub status: JobStatus,
    /// Overall progress, 0 to 100.
    pub progress: f64,
    pub stage_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    pub attempt: u32,
    /// Human-readable message describing current activity.
    pub message: String,
    /// Set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Describes the current state of `job` as an event of `kind`.
    pub fn from_job(job: &Job, kind: EventKind) -> Self {
        Self {
            job_id: job.id.clone(),
            kind,
            status: job.status,
            progress: job.progress,
            stage_index: job.current_stage,
            stage_name: job.stage_name.clone(),
            attempt: job.attempt,
            message: job.message.clone(),
            error: job.error.clone(),
            result: job.result.clone(),
            timestamp: job.updated_at,
        }
    }

    /// Snapshot event used to seed a new subscription.
    pub fn snapshot(job: &Job) -> Self {
        Self::from_job(job, EventKind::for_status(job.status))
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
