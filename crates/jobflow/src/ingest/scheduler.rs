use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::distribution::distribute;
use super::source::{IngestItem, IngestSource};
use super::IngestError;
use crate::config::IngestConfig;
use crate::error::{JobflowError, WorkerError};
use crate::fingerprint::Fingerprint;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub allocated: usize,
    pub fetched: usize,
    pub submitted: usize,
    pub error: Option<String>,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub fetched: usize,
    /// New jobs created.
    pub submitted: usize,
    /// Items absorbed by an existing job.
    pub attached: usize,
    /// Items repeated within this run.
    pub duplicates: usize,
    /// Items refused because the worker pool was at capacity.
    pub rejected: usize,
    pub errors: usize,
    pub per_source: BTreeMap<String, SourceReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Polls weighted sources on an interval and submits what they return.
pub struct IngestScheduler {
    orchestrator: Arc<Orchestrator>,
    sources: Vec<Arc<dyn IngestSource>>,
    pipeline: String,
    interval: Duration,
    fetch_limit: usize,
    fetch_timeout: Duration,
    shutdown: CancellationToken,
}

impl IngestScheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        config: &IngestConfig,
        sources: Vec<Arc<dyn IngestSource>>,
    ) -> Self {
        Self {
            orchestrator,
            sources,
            pipeline: config.pipeline.clone(),
            interval: config.interval(),
            fetch_limit: config.fetch_limit,
            fetch_timeout: config.fetch_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn sources(&self) -> &[Arc<dyn IngestSource>] {
        &self.sources
    }

    async fn fetch_source(
        &self,
        source: &dyn IngestSource,
        limit: usize,
    ) -> Result<Vec<IngestItem>, IngestError> {
        match tokio::time::timeout(self.fetch_timeout, source.fetch(limit)).await {
            Ok(Ok(mut items)) => {
                items.truncate(limit);
                Ok(items)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IngestError::Timeout {
                source_name: source.name().to_string(),
                seconds: self.fetch_timeout.as_secs(),
            }),
        }
    }

    /// Fetches from every source and submits new items.
    pub async fn run_once(&self) -> IngestReport {
        let started = Instant::now();
        let mut report = IngestReport::default();

        let weights: Vec<f64> = self.sources.iter().map(|s| s.weight()).collect();
        let shares = distribute(self.fetch_limit, &weights);

        let fetches = self
            .sources
            .iter()
            .zip(shares)
            .filter(|(_, share)| *share > 0)
            .map(|(source, share)| async move {
                (source.name().to_string(), share, self.fetch_source(source.as_ref(), share).await)
            });
        let results = join_all(fetches).await;

        let mut seen = HashSet::new();
        for (name, allocated, result) in results {
            let mut source_report = SourceReport {
                allocated,
                ..SourceReport::default()
            };

            let items = match result {
                Ok(items) => items,
                Err(e) => {
                    warn!(source = %name, "Ingest source failed: {}", e);
                    source_report.error = Some(e.to_string());
                    report.errors += 1;
                    report.per_source.insert(name, source_report);
                    continue;
                }
            };
            source_report.fetched = items.len();
            report.fetched += items.len();

            for item in items {
                let fingerprint = match Fingerprint::of_url(&item.url) {
                    Ok(fp) => fp,
                    Err(e) => {
                        debug!(source = %name, url = %item.url, "Skipping item: {}", e);
                        report.errors += 1;
                        continue;
                    }
                };
                if !seen.insert(fingerprint.clone()) {
                    report.duplicates += 1;
                    continue;
                }

                let input = serde_json::json!({
                    "url": item.url,
                    "title": item.title,
                    "source": name,
                    "payload": item.payload,
                });
                match self
                    .orchestrator
                    .submit(fingerprint, input, &self.pipeline)
                    .await
                {
                    Ok(outcome) if outcome.attached => report.attached += 1,
                    Ok(_) => {
                        report.submitted += 1;
                        source_report.submitted += 1;
                    }
                    Err(JobflowError::Worker(WorkerError::AtCapacity { .. })) => {
                        report.rejected += 1;
                    }
                    Err(e) => {
                        warn!(source = %name, url = %item.url, "Failed to submit item: {}", e);
                        report.errors += 1;
                    }
                }
            }
            report.per_source.insert(name, source_report);
        }

        report.elapsed = started.elapsed();
        info!(
            fetched = report.fetched,
            submitted = report.submitted,
            attached = report.attached,
            duplicates = report.duplicates,
            rejected = report.rejected,
            errors = report.errors,
            "Ingest run finished in {:?}",
            report.elapsed
        );
        report
    }

    /// Runs ingestion on the configured interval until
    /// [`IngestScheduler::stop`]. A message on `trigger_rx` runs it at once.
    pub fn start(self: &Arc<Self>, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(scheduler.interval);
            timer.tick().await; // skip immediate first tick

            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                    Ok(()) = trigger_rx.recv() => {
                        info!("Manual ingest run triggered");
                    }
                }
                scheduler.run_once().await;
            }
            debug!("Ingest scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactRegistry;
    use crate::config::WorkerConfig;
    use crate::dedup::DedupIndex;
    use crate::hub::ProgressHub;
    use crate::pipeline::{
        PipelineDefinition, PipelineRegistry, PipelineRunner, Stage, StageContext,
        StageDefinition, StageError, StageOutput,
    };
    use crate::store::JobStore;
    use crate::worker::WorkerPool;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Hold;

    #[async_trait]
    impl Stage for Hold {
        async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
            ctx.cancelled().await;
            Err(StageError::Cancelled)
        }
    }

    struct Listing {
        name: &'static str,
        weight: f64,
        urls: Vec<&'static str>,
        requested: Mutex<Vec<usize>>,
    }

    impl Listing {
        fn new(name: &'static str, weight: f64, urls: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name,
                weight,
                urls,
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl IngestSource for Listing {
        fn name(&self) -> &str {
            self.name
        }

        fn weight(&self) -> f64 {
            self.weight
        }

        async fn fetch(&self, limit: usize) -> Result<Vec<IngestItem>, IngestError> {
            self.requested.lock().unwrap().push(limit);
            Ok(self
                .urls
                .iter()
                .map(|url| IngestItem::new(*url, format!("Title of {url}")))
                .collect())
        }
    }

    struct Down;

    #[async_trait]
    impl IngestSource for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn fetch(&self, _limit: usize) -> Result<Vec<IngestItem>, IngestError> {
            Err(IngestError::failed("down", "503 Service Unavailable"))
        }
    }

    fn orchestrator(queue_capacity: usize) -> Arc<Orchestrator> {
        let store = Arc::new(JobStore::new(ProgressHub::default()));
        let runner = Arc::new(PipelineRunner::new(Arc::clone(&store)));
        let pool = Arc::new(WorkerPool::start(
            WorkerConfig {
                max_concurrency: 1,
                queue_capacity,
                ..WorkerConfig::default()
            },
            runner,
        ));
        let mut pipelines = PipelineRegistry::new();
        pipelines
            .register(
                PipelineDefinition::builder("article")
                    .stage(StageDefinition::new("hold", 100.0, Arc::new(Hold)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(Orchestrator::new(
            store,
            Arc::new(DedupIndex::new()),
            pool,
            Arc::new(pipelines),
            Arc::new(ArtifactRegistry::new()),
        ))
    }

    fn config(fetch_limit: usize) -> IngestConfig {
        IngestConfig {
            pipeline: "article".to_string(),
            interval_secs: 3600,
            fetch_limit,
            fetch_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_run_distributes_and_skips_duplicates() {
        let orchestrator = orchestrator(64);
        let news = Listing::new(
            "news",
            3.0,
            vec![
                "https://news.example/a?utm_source=feed",
                "https://news.example/b",
                "https://news.example/a",
            ],
        );
        let blog = Listing::new("blog", 1.0, vec!["https://blog.example/post/"]);
        let scheduler = IngestScheduler::new(
            Arc::clone(&orchestrator),
            &config(10),
            vec![news.clone(), blog.clone(), Arc::new(Down)],
        );

        let report = scheduler.run_once().await;

        // One slot each, then 7 split 3:1:1 (4.2, 1.4, 1.4).
        assert_eq!(*news.requested.lock().unwrap(), vec![5]);
        assert_eq!(*blog.requested.lock().unwrap(), vec![3]);
        assert_eq!(report.fetched, 4);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.submitted, 3);
        assert_eq!(report.errors, 1);
        assert!(report.per_source["down"].error.is_some());
        assert_eq!(report.per_source["news"].submitted, 2);
        assert_eq!(orchestrator.store().len(), 3);

        let again = scheduler.run_once().await;
        assert_eq!(again.submitted, 0);
        assert_eq!(again.attached, 3);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_rejections_counted() {
        let orchestrator = orchestrator(1);
        let source = Listing::new(
            "feed",
            1.0,
            vec![
                "https://feed.example/1",
                "https://feed.example/2",
                "https://feed.example/3",
                "https://feed.example/4",
            ],
        );
        let _held = orchestrator.pool().reserve().unwrap();
        let scheduler = IngestScheduler::new(Arc::clone(&orchestrator), &config(4), vec![source]);

        let report = scheduler.run_once().await;
        assert_eq!(report.rejected, 4);
        assert_eq!(report.submitted, 0);
        assert!(orchestrator.store().is_empty());
    }
}
