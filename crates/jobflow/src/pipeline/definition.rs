use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::PipelineError;
use super::retry::RetryPolicy;
use super::stage::Stage;
use crate::config::StageSpec;

const WEIGHT_TOLERANCE: f64 = 1e-6;

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// A named stage bound to its implementation.
#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    /// Percentage of total progress contributed by this stage.
    pub weight: f64,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub stage: Arc<dyn Stage>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, weight: f64, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            weight,
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry: RetryPolicy::none(),
            stage,
        }
    }

    pub fn from_spec(spec: &StageSpec, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: spec.name.clone(),
            weight: spec.weight,
            timeout: spec.timeout(),
            retry: spec.retry_policy(),
            stage,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Immutable ordered list of stages for one pipeline type.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Result<Self, PipelineError> {
        let name = name.into();
        check_layout(&name, stages.iter().map(|s| (s.name.as_str(), s.weight)))?;
        for stage in &stages {
            if stage.timeout.is_zero() {
                return Err(PipelineError::InvalidStage {
                    pipeline: name,
                    stage: stage.name.clone(),
                    reason: "timeout must be positive".to_string(),
                });
            }
        }
        Ok(Self { name, stages })
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Progress reached once stage `index` has finished.
    pub fn cumulative_weight(&self, index: usize) -> f64 {
        if index + 1 >= self.stages.len() {
            return 100.0;
        }
        let total: f64 = self.stages[..=index].iter().map(|s| s.weight).sum();
        total.clamp(0.0, 100.0)
    }
}

pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<PipelineDefinition, PipelineError> {
        PipelineDefinition::new(self.name, self.stages)
    }
}

/// Checks names and weights of a pipeline's stages: at least one stage,
/// unique names, positive weights summing to 100.
pub fn check_layout<'a>(
    pipeline: &str,
    stages: impl IntoIterator<Item = (&'a str, f64)>,
) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    let mut total = 0.0;

    for (name, weight) in stages {
        if !seen.insert(name) {
            return Err(PipelineError::DuplicateStage {
                pipeline: pipeline.to_string(),
                stage: name.to_string(),
            });
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(PipelineError::InvalidWeight {
                pipeline: pipeline.to_string(),
                stage: name.to_string(),
                weight,
            });
        }
        total += weight;
    }

    if seen.is_empty() {
        return Err(PipelineError::Empty(pipeline.to_string()));
    }
    if (total - 100.0).abs() > WEIGHT_TOLERANCE {
        return Err(PipelineError::WeightSum {
            pipeline: pipeline.to_string(),
            total,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageContext, StageError, StageOutput};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Stage for Noop {
        async fn execute(&self, _ctx: StageContext) -> Result<StageOutput, StageError> {
            Ok(StageOutput::new(serde_json::Value::Null))
        }
    }

    fn stage(name: &str, weight: f64) -> StageDefinition {
        StageDefinition::new(name, weight, Arc::new(Noop))
    }

    #[test]
    fn test_build_valid_pipeline() {
        let pipeline = PipelineDefinition::builder("video")
            .stage(stage("extract", 30.0))
            .stage(stage("enrich", 40.0))
            .stage(stage("index", 30.0))
            .build()
            .unwrap();
        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.cumulative_weight(0), 30.0);
        assert_eq!(pipeline.cumulative_weight(1), 70.0);
        assert_eq!(pipeline.cumulative_weight(2), 100.0);
    }

    #[test]
    fn test_weights_must_sum_to_hundred() {
        let err = PipelineDefinition::builder("video")
            .stage(stage("extract", 30.0))
            .stage(stage("index", 30.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::WeightSum { .. }));
    }

    #[test]
    fn test_duplicate_and_empty_rejected() {
        let err = PipelineDefinition::builder("video")
            .stage(stage("extract", 50.0))
            .stage(stage("extract", 50.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage { .. }));

        let err = PipelineDefinition::builder("empty").build().unwrap_err();
        assert!(matches!(err, PipelineError::Empty(_)));
    }

    #[test]
    fn test_zero_weight_and_timeout_rejected() {
        let err = PipelineDefinition::builder("video")
            .stage(stage("extract", 0.0))
            .stage(stage("index", 100.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidWeight { .. }));

        let err = PipelineDefinition::builder("video")
            .stage(stage("extract", 100.0).timeout(Duration::ZERO))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }
}
