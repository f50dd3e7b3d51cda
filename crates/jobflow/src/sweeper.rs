//! Periodic cleanup of expired artifacts and stale dedup entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{Artifact, ArtifactRegistry, ArtifactStorage};
use crate::config::SweeperConfig;
use crate::dedup::DedupIndex;
use crate::store::{JobFilter, JobStore};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub artifacts_deleted: usize,
    /// Deletions that failed; the records stay for the next sweep.
    pub artifacts_failed: usize,
    pub dedup_released: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

pub struct CleanupSweeper {
    store: Arc<JobStore>,
    dedup: Arc<DedupIndex>,
    artifacts: Arc<ArtifactRegistry>,
    storage: Arc<dyn ArtifactStorage>,
    interval: Duration,
    batch_size: usize,
    retention: Duration,
    shutdown: CancellationToken,
}

impl CleanupSweeper {
    pub fn new(
        config: &SweeperConfig,
        retention: Duration,
        store: Arc<JobStore>,
        dedup: Arc<DedupIndex>,
        artifacts: Arc<ArtifactRegistry>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            store,
            dedup,
            artifacts,
            storage,
            interval: config.interval(),
            batch_size: config.batch_size.max(1),
            retention,
            shutdown: CancellationToken::new(),
        }
    }

    /// Deletes expired artifacts oldest first until the batch size is reached,
    /// then releases dedup entries of jobs that finished before the retention
    /// window.
    ///
    /// Failed deletions do not count against the batch: the scan continues
    /// past them, so artifacts that never delete cannot starve newer ones.
    pub async fn sweep_once(&self) -> SweepReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = SweepReport::default();

        let mut cursor: Option<Artifact> = None;
        while report.artifacts_deleted < self.batch_size {
            let page = self
                .artifacts
                .due_after(now, cursor.as_ref(), self.batch_size);
            let Some(last) = page.last().cloned() else {
                break;
            };
            for artifact in page {
                if report.artifacts_deleted >= self.batch_size {
                    break;
                }
                self.delete_artifact(&artifact, &mut report).await;
            }
            cursor = Some(last);
        }

        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|d| now.checked_sub_signed(d));
        if let Some(cutoff) = cutoff {
            let finished = self
                .store
                .list(JobFilter::terminal().completed_before(cutoff));
            for job in &finished {
                if self.dedup.release(&job.fingerprint, &job.id) {
                    report.dedup_released += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        if report.artifacts_deleted + report.artifacts_failed + report.dedup_released > 0 {
            tracing::info!(
                deleted = report.artifacts_deleted,
                failed = report.artifacts_failed,
                released = report.dedup_released,
                "Cleanup sweep finished"
            );
        }
        report
    }

    async fn delete_artifact(&self, artifact: &Artifact, report: &mut SweepReport) {
        match self.storage.delete(&artifact.location).await {
            Ok(()) => {
                self.artifacts.remove(&artifact.id);
                report.artifacts_deleted += 1;
            }
            Err(e) => {
                tracing::warn!(
                    artifact_id = %artifact.id,
                    location = %artifact.location,
                    "Failed to delete expired artifact: {}",
                    e
                );
                report.artifacts_failed += 1;
            }
        }
    }

    /// Runs sweeps on the configured interval until [`CleanupSweeper::stop`].
    /// A message on `trigger_rx` runs a sweep immediately.
    pub fn start(self: &Arc<Self>, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(sweeper.interval);
            timer.tick().await; // skip immediate first tick

            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                    Ok(()) = trigger_rx.recv() => {
                        tracing::info!("Manual cleanup sweep triggered");
                    }
                }
                sweeper.sweep_once().await;
            }
            tracing::debug!("Cleanup sweeper stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStorage;
    use crate::error::ArtifactError;
    use crate::fingerprint::Fingerprint;
    use crate::hub::ProgressHub;
    use crate::job::{ResultRef, Transition};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Stubborn;

    #[async_trait]
    impl ArtifactStorage for Stubborn {
        async fn store(&self, _bytes: &[u8], _hint: &str) -> Result<String, ArtifactError> {
            Ok("nowhere".to_string())
        }

        async fn delete(&self, location: &str) -> Result<(), ArtifactError> {
            Err(ArtifactError::Delete {
                path: location.into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy"),
            })
        }
    }

    /// Refuses to delete anything under `stuck/`.
    struct Selective;

    #[async_trait]
    impl ArtifactStorage for Selective {
        async fn store(&self, _bytes: &[u8], hint: &str) -> Result<String, ArtifactError> {
            Ok(hint.to_string())
        }

        async fn delete(&self, location: &str) -> Result<(), ArtifactError> {
            if location.starts_with("stuck/") {
                return Err(ArtifactError::Delete {
                    path: location.into(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
                });
            }
            Ok(())
        }
    }

    type Fixture = (
        Arc<CleanupSweeper>,
        Arc<JobStore>,
        Arc<DedupIndex>,
        Arc<ArtifactRegistry>,
    );

    fn sweeper(retention: Duration, storage: Arc<dyn ArtifactStorage>) -> Fixture {
        let store = Arc::new(JobStore::new(ProgressHub::default()));
        let dedup = Arc::new(DedupIndex::new());
        let artifacts = Arc::new(ArtifactRegistry::new());
        let sweeper = Arc::new(CleanupSweeper::new(
            &SweeperConfig::default(),
            retention,
            Arc::clone(&store),
            Arc::clone(&dedup),
            Arc::clone(&artifacts),
            storage,
        ));
        (sweeper, store, dedup, artifacts)
    }

    #[tokio::test]
    async fn test_expired_artifacts_deleted_fresh_kept() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(FsArtifactStorage::new(temp.path()));
        let (sweeper, _store, _dedup, artifacts) =
            sweeper(Duration::from_secs(3600), storage.clone());

        let old = storage.store(b"old", "a.bin").await.unwrap();
        let fresh = storage.store(b"fresh", "b.bin").await.unwrap();
        artifacts.register_with_expiry(old.clone(), None, Utc::now() - chrono::Duration::seconds(5));
        artifacts.register(fresh.clone(), None, Duration::from_secs(3600));

        let report = sweeper.sweep_once().await;
        assert_eq!(report.artifacts_deleted, 1);
        assert!(!std::path::Path::new(&old).exists());
        assert!(std::path::Path::new(&fresh).exists());
        assert_eq!(artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_record() {
        let (sweeper, _store, _dedup, artifacts) =
            sweeper(Duration::from_secs(3600), Arc::new(Stubborn));
        artifacts.register_with_expiry("x", None, Utc::now() - chrono::Duration::seconds(1));
        artifacts.register_with_expiry("y", None, Utc::now() - chrono::Duration::seconds(1));

        let report = sweeper.sweep_once().await;
        assert_eq!(report.artifacts_failed, 2);
        assert_eq!(artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_undeletable_artifacts_do_not_block_batch() {
        let store = Arc::new(JobStore::new(ProgressHub::default()));
        let artifacts = Arc::new(ArtifactRegistry::new());
        let sweeper = CleanupSweeper::new(
            &SweeperConfig {
                batch_size: 2,
                ..SweeperConfig::default()
            },
            Duration::from_secs(3600),
            store,
            Arc::new(DedupIndex::new()),
            Arc::clone(&artifacts),
            Arc::new(Selective),
        );
        let now = Utc::now();
        for name in ["stuck/1", "stuck/2", "stuck/3"] {
            artifacts.register_with_expiry(name, None, now - chrono::Duration::seconds(10));
        }
        let fine = artifacts.register_with_expiry("fine", None, now - chrono::Duration::seconds(5));
        let also_fine =
            artifacts.register_with_expiry("also-fine", None, now - chrono::Duration::seconds(1));

        let report = sweeper.sweep_once().await;
        assert_eq!(report.artifacts_deleted, 2);
        assert_eq!(report.artifacts_failed, 3);
        assert!(artifacts.get(&fine.id).is_none());
        assert!(artifacts.get(&also_fine.id).is_none());
        assert_eq!(artifacts.len(), 3);
    }

    #[tokio::test]
    async fn test_releases_dedup_after_retention() {
        let (sweeper, store, dedup, _artifacts) =
            sweeper(Duration::ZERO, Arc::new(Stubborn));
        let fp = Fingerprint::new("doc");
        let job = store.create(fp.clone(), serde_json::Value::Null, "p").unwrap();
        dedup.register(fp.clone(), job.id.clone()).unwrap();

        assert_eq!(sweeper.sweep_once().await.dedup_released, 0);

        store
            .transition(&job.id, Transition::running())
            .unwrap();
        store
            .transition(&job.id, Transition::completed(ResultRef::new("r")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(sweeper.sweep_once().await.dedup_released, 1);
        assert!(dedup.resolve(&fp).is_none());
        assert!(store.get(&job.id).is_ok());
    }

    #[tokio::test]
    async fn test_retention_keeps_recent_entries() {
        let (sweeper, store, dedup, _artifacts) =
            sweeper(Duration::from_secs(3600), Arc::new(Stubborn));
        let fp = Fingerprint::new("doc");
        let job = store.create(fp.clone(), serde_json::Value::Null, "p").unwrap();
        dedup.register(fp.clone(), job.id.clone()).unwrap();
        store
            .transition(&job.id, Transition::cancelled("stop"))
            .unwrap();

        assert_eq!(sweeper.sweep_once().await.dedup_released, 0);
        assert_eq!(dedup.resolve(&fp), Some(job.id));
    }

    #[tokio::test]
    async fn test_trigger_and_stop() {
        let storage = Arc::new(FsArtifactStorage::new("/nonexistent-root"));
        let (sweeper, _store, _dedup, artifacts) = sweeper(Duration::from_secs(3600), storage);
        artifacts.register_with_expiry(
            "/nonexistent-root/gone.bin",
            None,
            Utc::now() - chrono::Duration::seconds(1),
        );

        let (trigger_tx, trigger_rx) = broadcast::channel(4);
        let handle = sweeper.start(trigger_rx);
        trigger_tx.send(()).unwrap();

        for _ in 0..200 {
            if artifacts.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(artifacts.is_empty());

        sweeper.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
