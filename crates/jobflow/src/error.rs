use std::path::PathBuf;
use thiserror::Error;

use crate::fingerprint::{Fingerprint, FingerprintError};
use crate::ingest::IngestError;
use crate::job::{JobId, JobStatus};
use crate::pipeline::PipelineError;

#[derive(Error, Debug)]
pub enum JobflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dedup error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Unknown pipeline type: {0}")]
    UnknownPipeline(String),

    #[error("Job {job_id} has not completed (status: {status})")]
    NotComplete { job_id: JobId, status: JobStatus },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid pipeline '{name}': {reason}")]
    InvalidPipeline { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Fingerprint {fingerprint} is held by active job {existing}")]
    DuplicateFingerprint {
        fingerprint: Fingerprint,
        existing: JobId,
    },

    #[error("Invalid transition for job {job_id} ({from} -> {to}): {reason}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Fingerprint {fingerprint} is already registered to job {holder}")]
    AlreadyRegistered {
        fingerprint: Fingerprint,
        holder: JobId,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool at capacity ({capacity} queued jobs)")]
    AtCapacity { capacity: usize },

    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to write artifact '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete artifact '{path}': {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact location '{0}' is outside the storage root")]
    OutsideRoot(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("No artifact storage configured")]
    NoStorage,
}

pub type Result<T> = std::result::Result<T, JobflowError>;
