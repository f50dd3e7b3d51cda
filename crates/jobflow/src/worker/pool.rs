use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackpressurePolicy, WorkerConfig};
use crate::error::{StoreError, WorkerError};
use crate::job::{ErrorDetail, FailureKind, JobId, JobStatus, Transition};
use crate::pipeline::{PipelineDefinition, PipelineRunner};
use crate::store::JobStore;

/// Result of [`WorkerPool::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued, or its runner acknowledged within the grace period.
    Cancelled,
    /// The runner did not acknowledge in time; its task was aborted.
    ForceCancelled,
    /// The job was already terminal; nothing changed.
    AlreadyFinished(JobStatus),
}

struct QueuedJob {
    job_id: JobId,
    pipeline: Arc<PipelineDefinition>,
    cancel: CancellationToken,
}

enum JobSender {
    Bounded(mpsc::Sender<QueuedJob>),
    Unbounded(mpsc::UnboundedSender<QueuedJob>),
}

enum JobReceiver {
    Bounded(mpsc::Receiver<QueuedJob>),
    Unbounded(mpsc::UnboundedReceiver<QueuedJob>),
}

impl JobReceiver {
    async fn recv(&mut self) -> Option<QueuedJob> {
        match self {
            JobReceiver::Bounded(rx) => rx.recv().await,
            JobReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            JobReceiver::Bounded(rx) => rx.close(),
            JobReceiver::Unbounded(rx) => rx.close(),
        }
    }

    fn try_recv(&mut self) -> Option<QueuedJob> {
        match self {
            JobReceiver::Bounded(rx) => rx.try_recv().ok(),
            JobReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Bookkeeping for a job between `submit` and the end of its run.
struct InFlight {
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

type InFlightMap = Arc<Mutex<HashMap<JobId, InFlight>>>;

fn lock_inflight(map: &Mutex<HashMap<JobId, InFlight>>) -> MutexGuard<'_, HashMap<JobId, InFlight>> {
    match map.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            warn!("Worker pool lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Bounded pool of concurrently running pipeline jobs.
///
/// A single dispatcher task pulls queued jobs and runs each on its own task
/// once a concurrency permit is free.
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<JobStore>,
    sender: JobSender,
    semaphore: Arc<Semaphore>,
    inflight: InFlightMap,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A queue slot held between admission and submission.
///
/// Dropping it without calling [`Reservation::submit`] frees the slot.
pub struct Reservation<'a> {
    pool: &'a WorkerPool,
    permit: Option<mpsc::Permit<'a, QueuedJob>>,
}

impl Reservation<'_> {
    /// Enqueues the job into the reserved slot.
    pub fn submit(self, job_id: JobId, pipeline: Arc<PipelineDefinition>) -> Result<(), WorkerError> {
        let pool = self.pool;
        if pool.shutdown.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }

        let cancel = pool.shutdown.child_token();
        lock_inflight(&pool.inflight).insert(
            job_id.clone(),
            InFlight {
                cancel: cancel.clone(),
                abort: None,
            },
        );

        let queued = QueuedJob {
            job_id: job_id.clone(),
            pipeline,
            cancel,
        };
        let sent = match (self.permit, &pool.sender) {
            (Some(permit), _) => {
                permit.send(queued);
                true
            }
            (None, JobSender::Unbounded(tx)) => tx.send(queued).is_ok(),
            (None, JobSender::Bounded(_)) => false,
        };

        if !sent {
            lock_inflight(&pool.inflight).remove(&job_id);
            return Err(WorkerError::ShuttingDown);
        }
        debug!(job_id = %job_id, "Job queued");
        Ok(())
    }
}

impl WorkerPool {
    /// Creates the pool and spawns its dispatcher. Must be called within a
    /// tokio runtime.
    pub fn start(config: WorkerConfig, runner: Arc<PipelineRunner>) -> Self {
        let store = Arc::clone(runner.store());
        let (sender, receiver) = match config.backpressure {
            BackpressurePolicy::Reject => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                (JobSender::Bounded(tx), JobReceiver::Bounded(rx))
            }
            BackpressurePolicy::Queue => {
                let (tx, rx) = mpsc::unbounded_channel();
                (JobSender::Unbounded(tx), JobReceiver::Unbounded(rx))
            }
        };

        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let inflight: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        info!(
            "Starting worker pool with {} max workers ({:?} backpressure)",
            config.max_concurrency, config.backpressure
        );

        let dispatcher = Dispatcher {
            store: Arc::clone(&store),
            runner,
            semaphore: Arc::clone(&semaphore),
            inflight: Arc::clone(&inflight),
            shutdown: shutdown.clone(),
            job_timeout: config.job_timeout(),
        };
        let handle = tokio::spawn(dispatcher.run(receiver));

        Self {
            config,
            store,
            sender,
            semaphore,
            inflight,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Claims a queue slot, failing with `AtCapacity` when the queue is full
    /// under the reject policy.
    pub fn reserve(&self) -> Result<Reservation<'_>, WorkerError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        let permit = match &self.sender {
            JobSender::Bounded(tx) => match tx.try_reserve() {
                Ok(permit) => Some(permit),
                Err(mpsc::error::TrySendError::Full(())) => {
                    return Err(WorkerError::AtCapacity {
                        capacity: self.config.queue_capacity,
                    })
                }
                Err(mpsc::error::TrySendError::Closed(())) => return Err(WorkerError::ShuttingDown),
            },
            JobSender::Unbounded(_) => None,
        };
        Ok(Reservation { pool: self, permit })
    }

    /// Reserves and enqueues in one step.
    pub fn submit(&self, job_id: JobId, pipeline: Arc<PipelineDefinition>) -> Result<(), WorkerError> {
        self.reserve()?.submit(job_id, pipeline)
    }

    /// Cancels a job by id.
    ///
    /// Queued jobs are cancelled at once. A running job gets its token
    /// cancelled and the runner has `cancel_grace` to acknowledge before the
    /// task is aborted and the job force-cancelled.
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome, StoreError> {
        let job = self.store.get(job_id)?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.status));
        }

        let token = lock_inflight(&self.inflight)
            .get(job_id)
            .map(|entry| entry.cancel.clone());

        if job.status == JobStatus::Pending {
            if let Some(token) = &token {
                token.cancel();
            }
            return match self
                .store
                .transition_active(job_id, Transition::cancelled("Cancelled while queued"))?
            {
                Some(_) => {
                    info!(job_id = %job_id, "Queued job cancelled");
                    Ok(CancelOutcome::Cancelled)
                }
                None => Ok(CancelOutcome::AlreadyFinished(self.store.get(job_id)?.status)),
            };
        }

        if let Some(token) = token {
            let mut subscription = self.store.subscribe(job_id)?;
            token.cancel();

            let grace = self.config.cancel_grace();
            let acknowledged = tokio::time::timeout(grace, async {
                while let Some(event) = subscription.next().await {
                    if event.is_terminal() {
                        return Some(event.status);
                    }
                }
                None
            })
            .await;

            match acknowledged {
                Ok(Some(JobStatus::Cancelled)) => {
                    info!(job_id = %job_id, "Running job cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                Ok(Some(status)) => return Ok(CancelOutcome::AlreadyFinished(status)),
                _ => warn!(
                    job_id = %job_id,
                    grace_ms = grace.as_millis() as u64,
                    "Runner did not acknowledge cancellation, aborting"
                ),
            }
        }

        if let Some(entry) = lock_inflight(&self.inflight).remove(job_id) {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }

        match self.store.transition_active(
            job_id,
            Transition::cancelled("Force-cancelled after grace period"),
        )? {
            Some(_) => Ok(CancelOutcome::ForceCancelled),
            None => Ok(CancelOutcome::AlreadyFinished(self.store.get(job_id)?.status)),
        }
    }

    /// Stops dispatch, cancels queued and in-flight jobs, and waits for the
    /// workers to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.cancel();

        let handle = match self.dispatcher.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Worker pool dispatcher panicked: {}", e);
            }
        }

        let leftover: Vec<JobId> = lock_inflight(&self.inflight).drain().map(|(id, _)| id).collect();
        for job_id in leftover {
            cancel_for_shutdown(&self.store, &job_id);
        }
        info!("Worker pool stopped");
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        lock_inflight(&self.inflight).len()
    }

    /// Jobs currently holding a concurrency permit.
    pub fn running(&self) -> usize {
        self.config
            .max_concurrency
            .max(1)
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Dispatcher {
    store: Arc<JobStore>,
    runner: Arc<PipelineRunner>,
    semaphore: Arc<Semaphore>,
    inflight: InFlightMap,
    shutdown: CancellationToken,
    job_timeout: Duration,
}

impl Dispatcher {
    async fn run(self, mut receiver: JobReceiver) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        debug!("Worker pool dispatcher started");

        // A permit is taken before a job leaves the queue, so queued jobs stay
        // in the channel and count against its capacity.
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(result);
                    continue;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let queued = 'recv: loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'recv None,
                    Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join(result),
                    queued = receiver.recv() => break 'recv queued,
                }
            };
            let Some(queued) = queued else {
                break;
            };

            let job_id = queued.job_id.clone();
            let task_job_id = job_id.clone();
            let store = Arc::clone(&self.store);
            let runner = Arc::clone(&self.runner);
            let inflight = Arc::clone(&self.inflight);
            let job_timeout = self.job_timeout;

            let abort = tasks.spawn(async move {
                let _permit = permit;
                execute_job(&store, &runner, queued, job_timeout).await;
                lock_inflight(&inflight).remove(&task_job_id);
            });

            // The task may already be done and gone from the map.
            if let Some(entry) = lock_inflight(&self.inflight).get_mut(&job_id) {
                entry.abort = Some(abort);
            }
        }

        receiver.close();
        while let Some(queued) = receiver.try_recv() {
            cancel_for_shutdown(&self.store, &queued.job_id);
        }

        for entry in lock_inflight(&self.inflight).values() {
            entry.cancel.cancel();
        }
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
        debug!("Worker pool dispatcher stopped");
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Worker task panicked: {}", e);
        }
    }
}

async fn execute_job(
    store: &JobStore,
    runner: &PipelineRunner,
    queued: QueuedJob,
    job_timeout: Duration,
) {
    let QueuedJob {
        job_id,
        pipeline,
        cancel,
    } = queued;

    match tokio::time::timeout(job_timeout, runner.run(&job_id, &pipeline, cancel.clone())).await {
        Ok(Ok(outcome)) => debug!(job_id = %job_id, ?outcome, "Job run finished"),
        Ok(Err(e)) => error!(job_id = %job_id, "Job run aborted by store error: {}", e),
        Err(_) => {
            cancel.cancel();
            warn!(
                job_id = %job_id,
                timeout_secs = job_timeout.as_secs(),
                "Job exceeded its timeout"
            );
            let mut detail = ErrorDetail::new(
                FailureKind::JobTimeout,
                format!("job exceeded its {:?} timeout", job_timeout),
            );
            if let Ok(job) = store.get(&job_id) {
                if let Some(stage) = job.stage_name {
                    detail = detail.at_stage(job.current_stage, stage, job.attempt);
                }
            }
            if let Err(e) = store.transition_active(&job_id, Transition::failed(detail)) {
                error!(job_id = %job_id, "Failed to record job timeout: {}", e);
            }
        }
    }
}

fn cancel_for_shutdown(store: &JobStore, job_id: &JobId) {
    match store.transition_active(job_id, Transition::cancelled("Worker pool shut down")) {
        Ok(Some(_)) => debug!(job_id = %job_id, "Job cancelled by shutdown"),
        Ok(None) => {}
        Err(e) => warn!(job_id = %job_id, "Failed to cancel job on shutdown: {}", e),
    }
}
