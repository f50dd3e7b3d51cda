use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::pipeline::definition::check_layout;

const MAX_RETRY_BUDGET: u32 = 20;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Validate version
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let positive = [
        ("worker.max_concurrency", config.worker.max_concurrency as u64),
        ("worker.queue_capacity", config.worker.queue_capacity as u64),
        ("worker.job_timeout_secs", config.worker.job_timeout_secs),
        ("worker.cancel_grace_ms", config.worker.cancel_grace_ms),
        ("hub.subscriber_buffer", config.hub.subscriber_buffer as u64),
        ("hub.firehose_capacity", config.hub.firehose_capacity as u64),
        ("sweeper.interval_secs", config.sweeper.interval_secs),
        ("sweeper.batch_size", config.sweeper.batch_size as u64),
        ("artifacts.default_ttl_secs", config.artifacts.default_ttl_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than zero", field),
            });
        }
    }

    for (name, pipeline) in &config.pipelines {
        check_layout(
            name,
            pipeline.stages.iter().map(|s| (s.name.as_str(), s.weight)),
        )
        .map_err(|e| ConfigError::InvalidPipeline {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        for stage in &pipeline.stages {
            let invalid = |reason: String| ConfigError::InvalidPipeline {
                name: name.clone(),
                reason: format!("stage '{}': {}", stage.name, reason),
            };
            if stage.retry_budget > MAX_RETRY_BUDGET {
                return Err(invalid(format!(
                    "retry_budget {} exceeds {}",
                    stage.retry_budget, MAX_RETRY_BUDGET
                )));
            }
            if stage.timeout_ms == 0 {
                return Err(invalid("timeout_ms must be greater than zero".to_string()));
            }
            if stage.backoff.base_ms > stage.backoff.max_ms {
                return Err(invalid(format!(
                    "backoff base_ms {} exceeds max_ms {}",
                    stage.backoff.base_ms, stage.backoff.max_ms
                )));
            }
        }
    }

    if let Some(ingest) = &config.ingest {
        if !config.pipelines.contains_key(&ingest.pipeline) {
            return Err(ConfigError::Validation {
                message: format!("ingest.pipeline '{}' is not configured", ingest.pipeline),
            });
        }
        if ingest.interval_secs == 0 || ingest.fetch_limit == 0 || ingest.fetch_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "ingest interval, fetch limit and fetch timeout must be greater than zero"
                    .to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;

    fn minimal_config() -> &'static str {
        r#"{ "version": "1.0" }"#
    }

    fn pipeline_config(stages: &str) -> String {
        format!(
            r#"{{ "version": "1.0", "pipelines": {{ "video": {{ "stages": {stages} }} }} }}"#
        )
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let config = load_config_from_str(minimal_config()).unwrap();
        assert!(config.worker.max_concurrency >= 1);
        assert_eq!(config.worker.backpressure, BackpressurePolicy::Reject);
        assert_eq!(config.worker.queue_capacity, 64);
        assert_eq!(config.dedup.retention_secs, 86_400);
        assert_eq!(config.artifacts.default_ttl_secs, 86_400);
        assert!(config.pipelines.is_empty());
        assert!(config.ingest.is_none());
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        let result = load_config_from_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result =
            load_config_from_str(r#"{ "version": "1.0", "worker": { "max_concurrency": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_pipeline_weights_validated() {
        let ok = pipeline_config(
            r#"[{"name": "extract", "weight": 30}, {"name": "enrich", "weight": 40}, {"name": "index", "weight": 30}]"#,
        );
        let config = load_config_from_str(&ok).unwrap();
        let stages = &config.pipelines["video"].stages;
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].timeout_ms, 300_000);
        assert!(stages[0].backoff.jitter);

        let bad = pipeline_config(r#"[{"name": "extract", "weight": 30}]"#);
        assert!(matches!(
            load_config_from_str(&bad),
            Err(ConfigError::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_retry_budget_capped() {
        let bad = pipeline_config(r#"[{"name": "extract", "weight": 100, "retry_budget": 50}]"#);
        let err = load_config_from_str(&bad).unwrap_err();
        assert!(err.to_string().contains("retry_budget"));
    }

    #[test]
    fn test_ingest_pipeline_must_exist() {
        let json = r#"{ "version": "1.0", "ingest": { "pipeline": "news" } }"#;
        assert!(matches!(
            load_config_from_str(json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobflow.json");
        std::fs::write(&path, minimal_config()).unwrap();
        assert!(load_config(&path).is_ok());

        let missing = load_config(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }
}
