//! Facade over the store, dedup index, worker pool and artifact registry.
//!
//! Submissions for the same fingerprint are serialized through keyed async
//! locks, so resolve/create/register is one step per fingerprint. The store
//! independently refuses a second active job for a fingerprint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::artifacts::{Artifact, ArtifactRegistry, ArtifactStorage, FsArtifactStorage};
use crate::config::{ArtifactConfig, Config, DedupConfig, SweeperConfig, WorkerConfig};
use crate::db::Database;
use crate::dedup::DedupIndex;
use crate::error::{ArtifactError, JobflowError, Result, StoreError, WorkerError};
use crate::fingerprint::Fingerprint;
use crate::hub::{ProgressHub, Subscription};
use crate::job::{Job, JobId, JobStatus, ResultRef, Transition};
use crate::pipeline::{PipelineRegistry, PipelineRunner, StageCatalog};
use crate::store::{JobFilter, JobListing, JobStats, JobStore};
use crate::sweeper::CleanupSweeper;
use crate::worker::{CancelOutcome, WorkerPool};

/// Result of [`Orchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub job_id: JobId,
    /// `true` when an existing job absorbed the submission.
    pub attached: bool,
}

impl SubmitOutcome {
    fn created(job_id: JobId) -> Self {
        Self {
            job_id,
            attached: false,
        }
    }

    fn attached(job_id: JobId) -> Self {
        Self {
            job_id,
            attached: true,
        }
    }
}

/// Result of [`Orchestrator::retry_failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    /// Failed jobs inside the age window that were looked at.
    pub considered: usize,
    /// New jobs created for retried work.
    pub resubmitted: Vec<JobId>,
    /// Failed jobs whose fingerprint already had an active or completed job.
    pub attached: usize,
    /// Set when the pool refused a submission; the batch stops there.
    pub rejected: usize,
    pub errors: usize,
}

/// Overall verdict derived from the job counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Stale active jobs exist, or too many finished jobs failed.
    NeedsAttention,
}

/// Failed share of finished jobs above which health needs attention.
const FAILURE_RATE_THRESHOLD: f64 = 0.05;

impl HealthStatus {
    fn from_stats(stats: &JobStats) -> Self {
        let finished = stats.completed + stats.failed;
        let failure_rate = if finished == 0 {
            0.0
        } else {
            stats.failed as f64 / finished as f64
        };
        if stats.stale == 0 && failure_rate <= FAILURE_RATE_THRESHOLD {
            HealthStatus::Healthy
        } else {
            HealthStatus::NeedsAttention
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: HealthStatus,
    pub accepting: bool,
    pub jobs: JobStats,
    pub in_flight: usize,
    pub running: usize,
    pub max_concurrency: usize,
    pub dedup_entries: usize,
    pub artifacts: usize,
    pub pipelines: Vec<String>,
}

type KeyedLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
struct FingerprintLocks {
    locks: Mutex<HashMap<Fingerprint, KeyedLock>>,
}

impl FingerprintLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<Fingerprint, KeyedLock>> {
        match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("Fingerprint lock table was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    async fn acquire(&self, fingerprint: &Fingerprint) -> FingerprintGuard<'_> {
        let lock = Arc::clone(self.map().entry(fingerprint.clone()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        FingerprintGuard {
            locks: self,
            fingerprint: fingerprint.clone(),
            lock,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

struct FingerprintGuard<'a> {
    locks: &'a FingerprintLocks,
    fingerprint: Fingerprint,
    lock: KeyedLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        // Table entry plus ours: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.fingerprint);
        }
    }
}

pub struct Orchestrator {
    store: Arc<JobStore>,
    dedup: Arc<DedupIndex>,
    pool: Arc<WorkerPool>,
    pipelines: Arc<PipelineRegistry>,
    artifacts: Arc<ArtifactRegistry>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    retention: Duration,
    artifact_ttl: Duration,
    stale_after: Duration,
    locks: FingerprintLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        dedup: Arc<DedupIndex>,
        pool: Arc<WorkerPool>,
        pipelines: Arc<PipelineRegistry>,
        artifacts: Arc<ArtifactRegistry>,
    ) -> Self {
        Self {
            store,
            dedup,
            pool,
            pipelines,
            artifacts,
            storage: None,
            retention: DedupConfig::default().retention(),
            artifact_ttl: ArtifactConfig::default().default_ttl(),
            stale_after: WorkerConfig::default().job_timeout(),
            locks: FingerprintLocks::default(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// How long a completed job keeps absorbing identical submissions.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_artifact_ttl(mut self, ttl: Duration) -> Self {
        self.artifact_ttl = ttl;
        self
    }

    /// Builds every component from `config`, binding configured stages to
    /// implementations in `catalog`. Opens the database when enabled and
    /// restores persisted jobs and artifacts.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &Config, catalog: &StageCatalog) -> Result<Self> {
        let hub = ProgressHub::new(config.hub.subscriber_buffer, config.hub.firehose_capacity);
        let store = Arc::new(JobStore::new(hub));
        let dedup = Arc::new(DedupIndex::new());
        let artifacts = Arc::new(ArtifactRegistry::new());

        if let Some(path) = config.database.resolved_path() {
            let db = Database::open(&path)?;
            store.set_database(db.clone());
            artifacts.set_database(db);
            let jobs = store.load_from_database()?;
            let restored = artifacts.load_from_database()?;
            info!(jobs, artifacts = restored, "Restored persisted state");
        }

        let pipelines = Arc::new(PipelineRegistry::from_config(&config.pipelines, catalog)?);
        let runner = Arc::new(PipelineRunner::new(Arc::clone(&store)));
        let pool = Arc::new(WorkerPool::start(config.worker.clone(), runner));

        let mut orchestrator = Self::new(store, dedup, pool, pipelines, artifacts)
            .with_retention(config.dedup.retention())
            .with_artifact_ttl(config.artifacts.default_ttl());
        orchestrator.stale_after = config.worker.job_timeout();
        if let Some(dir) = config.artifacts.resolved_directory() {
            orchestrator = orchestrator.with_storage(Arc::new(FsArtifactStorage::new(dir)));
        }
        orchestrator.restore_dedup();
        Ok(orchestrator)
    }

    /// Re-registers fingerprints of completed jobs still inside the
    /// retention window, newest completion winning.
    fn restore_dedup(&self) {
        for job in &self.store.list(JobFilter::new().status(JobStatus::Completed)) {
            if !self.absorbs(&job) {
                continue;
            }
            if let Some(holder) = self.dedup.resolve(&job.fingerprint) {
                let newer = self
                    .store
                    .get(&holder)
                    .map(|held| held.completed_at < job.completed_at)
                    .unwrap_or(true);
                if !newer {
                    continue;
                }
                self.dedup.release(&job.fingerprint, &holder);
            }
            if let Err(e) = self.dedup.register(job.fingerprint.clone(), job.id.clone()) {
                warn!(job_id = %job.id, "Could not restore dedup entry: {}", e);
            }
        }
    }

    /// Whether `job` absorbs a new submission of its fingerprint.
    fn absorbs(&self, job: &Job) -> bool {
        match job.status {
            JobStatus::Pending | JobStatus::Running => true,
            JobStatus::Completed => {
                let cutoff = chrono::Duration::from_std(self.retention)
                    .ok()
                    .and_then(|d| Utc::now().checked_sub_signed(d));
                match (job.completed_at, cutoff) {
                    (Some(at), Some(cutoff)) => at >= cutoff,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            }
            JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }

    /// Submits work, or attaches to an existing job with the same
    /// fingerprint that is active or completed within the retention window.
    pub async fn submit(
        &self,
        fingerprint: Fingerprint,
        input: serde_json::Value,
        pipeline: &str,
    ) -> Result<SubmitOutcome> {
        let definition = self
            .pipelines
            .get(pipeline)
            .ok_or_else(|| JobflowError::UnknownPipeline(pipeline.to_string()))?;

        let _guard = self.locks.acquire(&fingerprint).await;

        if let Some(existing) = self.dedup.resolve(&fingerprint) {
            match self.store.get(&existing) {
                Ok(job) if self.absorbs(&job) => {
                    debug!(
                        fingerprint = %fingerprint,
                        job_id = %existing,
                        status = %job.status,
                        "Submission attached to existing job"
                    );
                    return Ok(SubmitOutcome::attached(existing));
                }
                _ => {
                    self.dedup.release(&fingerprint, &existing);
                }
            }
        }

        let reservation = self.pool.reserve()?;

        let job = match self.store.create(fingerprint.clone(), input, pipeline) {
            Ok(job) => job,
            Err(StoreError::DuplicateFingerprint { existing, .. }) => {
                if let Err(e) = self.dedup.register(fingerprint, existing.clone()) {
                    warn!("Dedup index disagrees with store: {}", e);
                }
                return Ok(SubmitOutcome::attached(existing));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.dedup.register(fingerprint.clone(), job.id.clone()) {
            self.abandon(&job.id, "Fingerprint registration failed");
            return Err(e.into());
        }

        if let Err(e) = reservation.submit(job.id.clone(), definition) {
            self.abandon(&job.id, "Not accepted by the worker pool");
            self.dedup.release(&fingerprint, &job.id);
            return Err(e.into());
        }

        info!(job_id = %job.id, pipeline, "Job submitted");
        Ok(SubmitOutcome::created(job.id))
    }

    /// Resubmits up to `limit` failed jobs that finished within `max_age`,
    /// oldest first, reusing each job's fingerprint, input and pipeline.
    ///
    /// Resubmission goes through [`Orchestrator::submit`], so a fingerprint
    /// already held by an active or recently completed job attaches instead.
    pub async fn retry_failed(&self, max_age: Duration, limit: usize) -> RetryReport {
        let mut report = RetryReport::default();
        let mut filter = JobFilter::new().status(JobStatus::Failed).limit(limit);
        if let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        {
            filter = filter.completed_after(cutoff);
        }

        for job in &self.store.list(filter) {
            report.considered += 1;
            match self
                .submit(job.fingerprint.clone(), job.input.clone(), &job.pipeline)
                .await
            {
                Ok(outcome) if outcome.attached => report.attached += 1,
                Ok(outcome) => {
                    debug!(failed = %job.id, job_id = %outcome.job_id, "Failed job resubmitted");
                    report.resubmitted.push(outcome.job_id);
                }
                Err(JobflowError::Worker(WorkerError::AtCapacity { .. })) => {
                    report.rejected += 1;
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job.id, "Could not retry failed job: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.considered > 0 {
            info!(
                considered = report.considered,
                resubmitted = report.resubmitted.len(),
                attached = report.attached,
                rejected = report.rejected,
                errors = report.errors,
                "Retried failed jobs"
            );
        }
        report
    }

    fn abandon(&self, job_id: &JobId, reason: &str) {
        if let Err(e) = self
            .store
            .transition_active(job_id, Transition::cancelled(reason))
        {
            warn!(job_id = %job_id, "Failed to cancel abandoned job: {}", e);
        }
    }

    pub fn subscribe(&self, job_id: &JobId) -> Result<Subscription> {
        Ok(self.store.subscribe(job_id)?)
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        Ok(self.pool.cancel(job_id).await?)
    }

    pub fn status(&self, job_id: &JobId) -> Result<Job> {
        Ok(self.store.get(job_id)?)
    }

    /// The result reference of a completed job.
    pub fn result(&self, job_id: &JobId) -> Result<ResultRef> {
        let job = self.store.get(job_id)?;
        match (job.status, job.result) {
            (JobStatus::Completed, Some(result)) => Ok(result),
            (status, _) => Err(JobflowError::NotComplete {
                job_id: job.id,
                status,
            }),
        }
    }

    pub fn list(&self, filter: JobFilter) -> JobListing<'_> {
        self.store.list(filter)
    }

    pub fn health(&self) -> Health {
        let jobs = self.store.stats(self.stale_after);
        Health {
            status: HealthStatus::from_stats(&jobs),
            accepting: self.pool.is_running(),
            jobs,
            in_flight: self.pool.in_flight(),
            running: self.pool.running(),
            max_concurrency: self.pool.max_concurrency(),
            dedup_entries: self.dedup.len(),
            artifacts: self.artifacts.len(),
            pipelines: self
                .pipelines
                .names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Records an externally created transient resource. `ttl` defaults to
    /// the configured artifact TTL.
    pub fn register_artifact(
        &self,
        location: impl Into<String>,
        job_id: Option<JobId>,
        ttl: Option<Duration>,
    ) -> Artifact {
        self.artifacts
            .register(location, job_id, ttl.unwrap_or(self.artifact_ttl))
    }

    /// Writes `bytes` through the artifact storage and records the result.
    pub async fn store_artifact(
        &self,
        bytes: &[u8],
        hint: &str,
        job_id: Option<JobId>,
        ttl: Option<Duration>,
    ) -> Result<Artifact> {
        let storage = self.storage.as_ref().ok_or(ArtifactError::NoStorage)?;
        let location = storage.store(bytes, hint).await?;
        Ok(self.register_artifact(location, job_id, ttl))
    }

    /// A sweeper over this orchestrator's state, if artifact storage is
    /// configured.
    pub fn cleanup_sweeper(&self, config: &SweeperConfig) -> Option<CleanupSweeper> {
        let storage = self.storage.as_ref()?;
        Some(CleanupSweeper::new(
            config,
            self.retention,
            Arc::clone(&self.store),
            Arc::clone(&self.dedup),
            Arc::clone(&self.artifacts),
            Arc::clone(storage),
        ))
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn hub(&self) -> &ProgressHub {
        self.store.hub()
    }

    pub fn dedup(&self) -> &Arc<DedupIndex> {
        &self.dedup
    }

    pub fn artifacts(&self) -> &Arc<ArtifactRegistry> {
        &self.artifacts
    }

    pub fn pipelines(&self) -> &Arc<PipelineRegistry> {
        &self.pipelines
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}
