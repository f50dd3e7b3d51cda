use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::IngestError;

/// One item offered by an ingestion source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestItem {
    pub url: String,
    pub title: String,
    /// Source-specific extras passed through to the job input.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IngestItem {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A feed of candidate work items polled by the ingest scheduler.
#[async_trait]
pub trait IngestSource: Send + Sync {
    fn name(&self) -> &str;

    /// Relative share of each run's fetch limit.
    fn weight(&self) -> f64 {
        1.0
    }

    /// Returns at most `limit` items, newest first.
    async fn fetch(&self, limit: usize) -> Result<Vec<IngestItem>, IngestError>;
}
