use std::collections::HashMap;
use std::sync::Arc;

use super::definition::{PipelineDefinition, StageDefinition};
use super::error::PipelineError;
use super::stage::Stage;
use crate::config::PipelineConfig;

/// Stage implementations by name, used to bind configured stages.
#[derive(Default, Clone)]
pub struct StageCatalog {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn with(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.register(name, stage);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }
}

/// Pipeline types known to the orchestrator.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every configured pipeline's stages to implementations in
    /// `catalog`, looked up by `implementation` or else the stage name.
    pub fn from_config<'a>(
        pipelines: impl IntoIterator<Item = (&'a String, &'a PipelineConfig)>,
        catalog: &StageCatalog,
    ) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        for (name, config) in pipelines {
            let stages = config
                .stages
                .iter()
                .map(|spec| {
                    let implementation = spec.implementation.as_deref().unwrap_or(&spec.name);
                    catalog
                        .get(implementation)
                        .map(|stage| StageDefinition::from_spec(spec, stage))
                        .ok_or_else(|| PipelineError::MissingStage {
                            pipeline: name.clone(),
                            stage: spec.name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            registry.register(PipelineDefinition::new(name.clone(), stages)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, pipeline: PipelineDefinition) -> Result<(), PipelineError> {
        if self.pipelines.contains_key(pipeline.name()) {
            return Err(PipelineError::AlreadyRegistered(pipeline.name().to_string()));
        }
        self.pipelines
            .insert(pipeline.name().to_string(), Arc::new(pipeline));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::pipeline::{StageContext, StageError, StageOutput};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        async fn execute(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
            Ok(StageOutput::new((*ctx.input).clone()))
        }
    }

    const CONFIG: &str = r#"{
        "version": "1.0",
        "pipelines": {
            "document": {
                "stages": [
                    {"name": "extract", "weight": 50, "timeout_ms": 1000},
                    {"name": "summarize", "weight": 50, "implementation": "echo", "retry_budget": 2}
                ]
            }
        }
    }"#;

    #[test]
    fn test_from_config_binds_stages() {
        let config = load_config_from_str(CONFIG).unwrap();
        let catalog = StageCatalog::new()
            .with("extract", Arc::new(Echo))
            .with("echo", Arc::new(Echo));

        let registry = PipelineRegistry::from_config(&config.pipelines, &catalog).unwrap();
        let pipeline = registry.get("document").unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.stages()[1].name, "summarize");
        assert_eq!(pipeline.stages()[1].retry.max_retries, 2);
        assert_eq!(registry.names(), vec!["document"]);
        assert!(registry.get("video").is_none());
    }

    #[test]
    fn test_from_config_missing_implementation() {
        let config = load_config_from_str(CONFIG).unwrap();
        let catalog = StageCatalog::new().with("extract", Arc::new(Echo));
        let err = PipelineRegistry::from_config(&config.pipelines, &catalog).err().unwrap();
        assert!(matches!(err, PipelineError::MissingStage { stage, .. } if stage == "summarize"));
    }

    #[test]
    fn test_register_twice_rejected() {
        let mut registry = PipelineRegistry::new();
        let def = PipelineDefinition::builder("web")
            .stage(StageDefinition::new("fetch", 100.0, Arc::new(Echo)))
            .build()
            .unwrap();
        registry.register(def.clone()).unwrap();
        assert!(matches!(
            registry.register(def),
            Err(PipelineError::AlreadyRegistered(_))
        ));
    }
}
