use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::JobStatus;
use crate::fingerprint::Fingerprint;

/// Opaque job identifier (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Reference to the output of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure hiccup; the stage exhausted its retry budget.
    Transient,
    /// The content itself cannot be processed.
    Permanent,
    StageTimeout,
    JobTimeout,
    /// The process stopped while the job was active.
    Interrupted,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::StageTimeout => "stage_timeout",
            FailureKind::JobTimeout => "job_timeout",
            FailureKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Structured failure record, present iff the job is `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
    pub attempts: u32,
    pub kind: FailureKind,
    pub message: String,
    /// False for content failures that would fail again on resubmission.
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage: None,
            stage_index: None,
            attempts: 0,
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn at_stage(mut self, index: usize, name: impl Into<String>, attempts: u32) -> Self {
        self.stage = Some(name.into());
        self.stage_index = Some(index);
        self.attempts = attempts;
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.stage, self.stage_index) {
            (Some(stage), Some(index)) => write!(
                f,
                "{} in stage '{}' (#{}, {} attempt(s)): {}",
                self.kind, stage, index, self.attempts, self.message
            ),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Output of a finished stage, kept for diagnostics even when a later
/// stage fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub name: String,
    pub attempts: u32,
    pub output: serde_json::Value,
    pub finished_at: DateTime<Utc>,
}

/// A unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub fingerprint: Fingerprint,
    pub pipeline: String,
    pub status: JobStatus,
    /// 0.0 to 100.0, never decreasing.
    pub progress: f64,
    pub current_stage: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    /// 1-based attempt of the current stage, 0 before the first run.
    pub attempt: u32,
    pub message: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new `pending` job.
    pub fn new(fingerprint: Fingerprint, input: serde_json::Value, pipeline: &str) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            fingerprint,
            pipeline: pipeline.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            current_stage: 0,
            stage_name: None,
            attempt: 0,
            message: "Queued for processing".to_string(),
            input,
            result: None,
            error: None,
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
