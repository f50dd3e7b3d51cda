use chrono::{DateTime, Utc};
use serde::Serialize;

use super::JobStore;
use crate::job::{Job, JobId, JobStatus};

/// Filter for job listing. Empty fields match everything.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub pipeline: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub completed_before: Option<DateTime<Utc>>,
    pub completed_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn terminal() -> Self {
        Self {
            statuses: Some(vec![
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ]),
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            statuses: Some(vec![JobStatus::Pending, JobStatus::Running]),
            ..Self::default()
        }
    }

    pub fn pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn completed_before(mut self, at: DateTime<Utc>) -> Self {
        self.completed_before = Some(at);
        self
    }

    pub fn completed_after(mut self, at: DateTime<Utc>) -> Self {
        self.completed_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(pipeline) = &self.pipeline {
            if &job.pipeline != pipeline {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if job.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if job.created_at >= before {
                return false;
            }
        }
        if let Some(before) = self.completed_before {
            match job.completed_at {
                Some(completed_at) if completed_at < before => {}
                _ => return false,
            }
        }
        if let Some(after) = self.completed_after {
            match job.completed_at {
                Some(completed_at) if completed_at >= after => {}
                _ => return false,
            }
        }
        true
    }
}

/// Lazy, restartable listing of jobs matching a filter.
///
/// Each call to [`JobListing::iter`] takes a fresh snapshot of matching ids
/// (oldest first) and then reads the current record of each job as the
/// iterator advances. Jobs that stop matching in between are skipped.
pub struct JobListing<'a> {
    store: &'a JobStore,
    filter: JobFilter,
}

impl<'a> JobListing<'a> {
    pub(crate) fn new(store: &'a JobStore, filter: JobFilter) -> Self {
        Self { store, filter }
    }

    pub fn iter(&self) -> JobIter<'a> {
        JobIter {
            store: self.store,
            ids: self.store.matching_ids(&self.filter).into_iter(),
            filter: self.filter.clone(),
        }
    }
}

impl<'a> IntoIterator for &JobListing<'a> {
    type Item = Job;
    type IntoIter = JobIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct JobIter<'a> {
    store: &'a JobStore,
    ids: std::vec::IntoIter<JobId>,
    filter: JobFilter,
}

impl Iterator for JobIter<'_> {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        for id in self.ids.by_ref() {
            if let Ok(job) = self.store.get(&id) {
                if self.filter.matches(&job) {
                    return Some(job);
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}

/// Per-status counts for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Active jobs not updated within the staleness threshold.
    pub stale: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }

    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}
