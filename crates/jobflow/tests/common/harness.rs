//! Test harness for isolated orchestrator runs.
//!
//! `TestHarness` owns a temporary directory for artifacts and wires a job
//! store, dedup index, worker pool and pipeline registry together the same
//! way `Orchestrator::from_config` does, but with in-test stage
//! implementations.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use jobflow::config::WorkerConfig;
use jobflow::{
    ArtifactRegistry, DedupIndex, Fingerprint, FsArtifactStorage, Job, JobId, JobStatus,
    Orchestrator, PipelineDefinition, PipelineRegistry, PipelineRunner, ProgressEvent,
    ProgressHub, JobStore, SubmitOutcome, WorkerPool,
};

/// Upper bound on how long any test waits for a job to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Isolated orchestrator with filesystem artifact storage under a temp dir.
pub struct TestHarness {
    temp_dir: TempDir,
    /// Root of the artifact storage.
    pub artifact_dir: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    /// Create a harness with the default worker settings.
    pub fn new(pipelines: Vec<PipelineDefinition>) -> Self {
        Self::with_worker(pipelines, super::WorkerSpec::new().build(), Duration::from_secs(3600))
    }

    /// Create a harness with explicit worker settings and dedup retention.
    pub fn with_worker(
        pipelines: Vec<PipelineDefinition>,
        worker: WorkerConfig,
        retention: Duration,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let artifact_dir = temp_dir.path().join("artifacts");

        let store = Arc::new(JobStore::new(ProgressHub::default()));
        let runner = Arc::new(PipelineRunner::new(Arc::clone(&store)));
        let pool = Arc::new(WorkerPool::start(worker, runner));

        let mut registry = PipelineRegistry::new();
        for pipeline in pipelines {
            registry.register(pipeline).expect("unique pipeline names");
        }

        let orchestrator = Orchestrator::new(
            store,
            Arc::new(DedupIndex::new()),
            pool,
            Arc::new(registry),
            Arc::new(ArtifactRegistry::new()),
        )
        .with_retention(retention)
        .with_storage(Arc::new(FsArtifactStorage::new(&artifact_dir)));

        Self {
            temp_dir,
            artifact_dir,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Submits `key` under `pipeline`, panicking on error.
    pub async fn submit(&self, key: &str, pipeline: &str) -> SubmitOutcome {
        self.orchestrator
            .submit(
                Fingerprint::new(key),
                serde_json::json!({ "key": key }),
                pipeline,
            )
            .await
            .expect("submission accepted")
    }

    /// Subscribes to every job's events; call before submitting to see the
    /// full history.
    pub fn recorder(&self) -> EventRecorder {
        EventRecorder {
            rx: self.orchestrator.hub().subscribe_all(),
        }
    }

    /// Waits until the job reaches a terminal status and returns it.
    pub async fn wait_terminal(&self, job_id: &JobId) -> Job {
        let mut subscription = self
            .orchestrator
            .subscribe(job_id)
            .expect("job exists");
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            while subscription.next().await.is_some() {}
        })
        .await
        .expect("job settled in time");
        self.orchestrator.status(job_id).expect("job exists")
    }

    /// Waits until the job reports `status` at `stage_index`.
    pub async fn wait_for_stage(&self, job_id: &JobId, status: JobStatus, stage_index: usize) {
        let mut subscription = self
            .orchestrator
            .subscribe(job_id)
            .expect("job exists");
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            while let Some(event) = subscription.next().await {
                if event.status == status && event.stage_index == stage_index {
                    return;
                }
            }
            panic!("job finished before reaching stage {}", stage_index);
        })
        .await
        .expect("stage reached in time");
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

/// Records events from the hub's all-jobs channel.
pub struct EventRecorder {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl EventRecorder {
    /// Collects `job_id`'s events up to and including its terminal event.
    pub async fn until_terminal(&mut self, job_id: &JobId) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            loop {
                let event = self.rx.recv().await.expect("hub channel open");
                if &event.job_id != job_id {
                    continue;
                }
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
        })
        .await
        .expect("terminal event in time");
        events
    }
}
