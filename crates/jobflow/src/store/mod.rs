//! Job store with optional write-through database persistence.
//!
//! The store is the single source of truth for job status and progress.
//! Every accepted transition is published to the [`ProgressHub`] while the
//! write lock is held, so each job's events reach subscribers in
//! transition order.

mod query;

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

pub use query::{JobFilter, JobIter, JobListing, JobStats};

use crate::db::job_repo::{self, JobRow};
use crate::db::{Database, DatabaseError};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::hub::{EventKind, ProgressEvent, ProgressHub, Subscription};
use crate::job::{ErrorDetail, FailureKind, Job, JobId, Transition};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    /// Fingerprint -> job for jobs in `pending` or `running`.
    active: HashMap<Fingerprint, JobId>,
}

pub struct JobStore {
    /// Database handle; clones share the connection.
    db: RwLock<Option<Database>>,
    state: RwLock<StoreState>,
    hub: ProgressHub,
}

impl JobStore {
    pub fn new(hub: ProgressHub) -> Self {
        Self {
            db: RwLock::new(None),
            state: RwLock::new(StoreState::default()),
            hub,
        }
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    /// Sets the database connection used for write-through.
    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    /// Gets a cloned database handle if available.
    pub fn get_database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        match self.state.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        match self.state.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    // ─── Mutations ──────────────────────────────────────────────────────────

    /// Creates a `pending` job.
    pub fn create(
        &self,
        fingerprint: Fingerprint,
        input: serde_json::Value,
        pipeline: &str,
    ) -> Result<Job, StoreError> {
        let mut state = self.write_state();
        if let Some(existing) = state.active.get(&fingerprint) {
            return Err(StoreError::DuplicateFingerprint {
                fingerprint,
                existing: existing.clone(),
            });
        }

        let job = Job::new(fingerprint, input, pipeline);
        state.active.insert(job.fingerprint.clone(), job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());

        self.persist(&job);
        self.hub.publish(ProgressEvent::from_job(&job, EventKind::Created));
        tracing::debug!(job_id = %job.id, pipeline = %job.pipeline, "Job created");
        Ok(job)
    }

    /// Applies `change` to the job.
    ///
    /// Rejected moves are programmer errors and are logged at error level.
    pub fn transition(&self, job_id: &JobId, change: Transition) -> Result<Job, StoreError> {
        self.apply(job_id, change, false)?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }

    /// Like [`JobStore::transition`], but returns `Ok(None)` when the job has
    /// already reached a terminal state (cancelled or timed out elsewhere).
    pub fn transition_active(
        &self,
        job_id: &JobId,
        change: Transition,
    ) -> Result<Option<Job>, StoreError> {
        self.apply(job_id, change, true)
    }

    fn apply(
        &self,
        job_id: &JobId,
        change: Transition,
        tolerate_terminal: bool,
    ) -> Result<Option<Job>, StoreError> {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

        if tolerate_terminal && job.status.is_terminal() {
            tracing::debug!(
                job_id = %job_id,
                status = %job.status,
                "Ignoring update for finished job"
            );
            return Ok(None);
        }

        if let Err(reason) = change.validate(job) {
            tracing::error!(
                job_id = %job_id,
                from = %job.status,
                to = %change.status,
                "Rejected job transition: {}",
                reason
            );
            return Err(StoreError::InvalidTransition {
                job_id: job_id.clone(),
                from: job.status,
                to: change.status,
                reason,
            });
        }

        change.apply(job);
        let job = job.clone();

        if job.status.is_terminal() && state.active.get(&job.fingerprint) == Some(&job.id) {
            state.active.remove(&job.fingerprint);
        }

        self.persist(&job);
        self.hub
            .publish(ProgressEvent::from_job(&job, EventKind::for_status(job.status)));
        Ok(Some(job))
    }

    fn persist(&self, job: &Job) {
        if let Some(db) = self.get_database() {
            let result = JobRow::from_job(job).and_then(|row| job_repo::upsert(&db, &row));
            if let Err(e) = result {
                tracing::error!(job_id = %job.id, "Failed to persist job to database: {}", e);
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn get(&self, job_id: &JobId) -> Result<Job, StoreError> {
        self.read_state()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }

    /// Active job holding `fingerprint`, if any.
    pub fn active_job(&self, fingerprint: &Fingerprint) -> Option<JobId> {
        self.read_state().active.get(fingerprint).cloned()
    }

    pub fn list(&self, filter: JobFilter) -> JobListing<'_> {
        JobListing::new(self, filter)
    }

    pub(crate) fn matching_ids(&self, filter: &JobFilter) -> Vec<JobId> {
        let state = self.read_state();
        let mut matching: Vec<&Job> = state.jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let limit = filter.limit.unwrap_or(usize::MAX);
        matching.into_iter().take(limit).map(|j| j.id.clone()).collect()
    }

    /// Subscribes to a job's events, seeded with its current state.
    ///
    /// Holding the read lock while registering excludes concurrent
    /// transitions, so no event falls between the snapshot and the first
    /// live event.
    pub fn subscribe(&self, job_id: &JobId) -> Result<Subscription, StoreError> {
        let state = self.read_state();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        Ok(self.hub.subscribe(ProgressEvent::snapshot(job)))
    }

    /// Counts per status. Active jobs whose last update is older than
    /// `stale_after` are also counted as stale.
    pub fn stats(&self, stale_after: Duration) -> JobStats {
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let state = self.read_state();
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.count(job.status);
            if let Some(cutoff) = cutoff {
                if job.status.is_active() && job.updated_at < cutoff {
                    stats.stale += 1;
                }
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.read_state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().jobs.is_empty()
    }

    // ─── Recovery ───────────────────────────────────────────────────────────

    /// Restores jobs persisted by a previous process.
    ///
    /// Jobs left `pending` or `running` cannot be resumed and are failed with
    /// an `interrupted` cause. Returns the number of jobs loaded.
    pub fn load_from_database(&self) -> Result<usize, DatabaseError> {
        let Some(db) = self.get_database() else {
            return Ok(0);
        };

        let rows = job_repo::load_all(&db)?;
        let mut loaded = 0;
        let mut interrupted = 0;
        let mut state = self.write_state();

        for row in rows {
            let mut job = match row.into_job() {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("Skipping unreadable job row: {}", e);
                    continue;
                }
            };
            if state.jobs.contains_key(&job.id) {
                continue;
            }

            if job.status.is_active() {
                let mut detail = ErrorDetail::new(
                    FailureKind::Interrupted,
                    "Process stopped while the job was active",
                );
                if let Some(stage) = job.stage_name.clone() {
                    detail = detail.at_stage(job.current_stage, stage, job.attempt);
                }
                Transition::failed(detail).apply(&mut job);
                self.persist(&job);
                interrupted += 1;
            }

            state.jobs.insert(job.id.clone(), job);
            loaded += 1;
        }

        tracing::info!(loaded, interrupted, "Restored jobs from database");
        Ok(loaded)
    }
}
