//! Scheduled ingestion from weighted external sources.

mod distribution;
mod scheduler;
mod source;

use thiserror::Error;

pub use distribution::distribute;
pub use scheduler::{IngestReport, IngestScheduler, SourceReport};
pub use source::{IngestItem, IngestSource};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("Source '{source_name}' timed out after {seconds}s")]
    Timeout { source_name: String, seconds: u64 },
}

impl IngestError {
    pub fn failed(source_name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        IngestError::Source {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}
