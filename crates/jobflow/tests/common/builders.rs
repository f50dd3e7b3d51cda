//! Scripted stages and builder patterns for creating test pipelines.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use jobflow::config::WorkerConfig;
use jobflow::pipeline::{PipelineDefinition, RetryPolicy, StageDefinition};
use jobflow::{Stage, StageContext, StageError, StageOutput};

/// Fails transiently a fixed number of times, then succeeds.
pub struct FlakyStage {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyStage {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FlakyStage {
    async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StageError::transient(format!("rate limited (call {})", call)));
        }
        Ok(StageOutput::new(json!({
            "stage": ctx.stage,
            "attempt": ctx.attempt,
            "prior": ctx.prior.as_deref().cloned(),
        })))
    }
}

/// Succeeds after sleeping, counting its invocations.
pub struct SleepStage {
    delay: Duration,
    calls: AtomicU32,
    result_ref: Option<&'static str>,
}

impl SleepStage {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicU32::new(0),
            result_ref: None,
        })
    }

    pub fn instant() -> Arc<Self> {
        Self::new(Duration::ZERO)
    }

    pub fn with_result(result_ref: &'static str) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            result_ref: Some(result_ref),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SleepStage {
    async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let output = StageOutput::new(json!({ "stage": ctx.stage }));
        Ok(match self.result_ref {
            Some(reference) => output.with_result_ref(reference),
            None => output,
        })
    }
}

/// Blocks until the job is cancelled.
pub struct HoldStage;

impl HoldStage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Stage for HoldStage {
    async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        ctx.cancelled().await;
        Err(StageError::Cancelled)
    }
}

/// Blocks and ignores cancellation entirely.
pub struct StubbornStage;

#[async_trait]
impl Stage for StubbornStage {
    async fn execute(&self, _ctx: StageContext) -> Result<StageOutput, StageError> {
        std::future::pending::<()>().await;
        Ok(StageOutput::new(serde_json::Value::Null))
    }
}

/// Retry policy with millisecond backoff and no jitter.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
    }
}

/// Builder for creating `PipelineDefinition` instances.
pub struct PipelineSpec {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, name: &str, weight: f64, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(StageDefinition::new(name, weight, stage));
        self
    }

    pub fn retrying_stage(
        mut self,
        name: &str,
        weight: f64,
        stage: Arc<dyn Stage>,
        retry: RetryPolicy,
    ) -> Self {
        self.stages
            .push(StageDefinition::new(name, weight, stage).retry(retry));
        self
    }

    pub fn timed_stage(
        mut self,
        name: &str,
        weight: f64,
        stage: Arc<dyn Stage>,
        timeout: Duration,
    ) -> Self {
        self.stages
            .push(StageDefinition::new(name, weight, stage).timeout(timeout));
        self
    }

    pub fn build(self) -> PipelineDefinition {
        PipelineDefinition::new(self.name, self.stages).expect("valid pipeline layout")
    }
}

/// Builder for creating `WorkerConfig` instances.
pub struct WorkerSpec {
    config: WorkerConfig,
}

impl WorkerSpec {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig {
                max_concurrency: 2,
                queue_capacity: 16,
                cancel_grace_ms: 500,
                ..WorkerConfig::default()
            },
        }
    }

    pub fn concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = secs;
        self
    }

    pub fn cancel_grace_ms(mut self, ms: u64) -> Self {
        self.config.cancel_grace_ms = ms;
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self::new()
    }
}
