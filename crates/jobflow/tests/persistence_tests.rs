//! Configuration-driven startup and restoring state from the database.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{HoldStage, SleepStage};
use jobflow::db::Database;
use jobflow::pipeline::StageCatalog;
use jobflow::{
    load_config, FailureKind, Fingerprint, JobStatus, JobStore, Orchestrator, ProgressHub,
    ResultRef, Transition,
};
use tempfile::TempDir;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let config = serde_json::json!({
        "version": "1.0",
        "worker": { "max_concurrency": 2, "queue_capacity": 8 },
        "database": { "path": dir.join("data").join("jobflow.db") },
        "artifacts": { "directory": dir.join("artifacts") },
        "pipelines": {
            "video": {
                "stages": [
                    { "name": "fetch", "weight": 30 },
                    { "name": "transcode", "weight": 70, "implementation": "hold" }
                ]
            },
            "article": {
                "stages": [
                    { "name": "summarize", "weight": 100, "retry_budget": 2 }
                ]
            }
        }
    });
    let path = dir.join("jobflow.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn catalog() -> StageCatalog {
    StageCatalog::new()
        .with("fetch", SleepStage::instant())
        .with("hold", HoldStage::new())
        .with("summarize", SleepStage::instant())
}

/// Writes one completed and one running job as a previous process would
/// have left them.
fn seed_previous_run(db_path: &Path) -> (jobflow::JobId, jobflow::JobId) {
    let store = JobStore::new(ProgressHub::default());
    store.set_database(Database::open(db_path).unwrap());

    let done = store
        .create(
            Fingerprint::new("https://news.example/a"),
            serde_json::json!({}),
            "article",
        )
        .unwrap();
    store
        .transition(&done.id, Transition::running().stage(0, "summarize"))
        .unwrap();
    store
        .transition(&done.id, Transition::completed(ResultRef::new("summaries/a")))
        .unwrap();

    let active = store
        .create(
            Fingerprint::new("https://videos.example/v/9"),
            serde_json::json!({}),
            "video",
        )
        .unwrap();
    store
        .transition(
            &active.id,
            Transition::running()
                .progress(30.0)
                .stage(1, "transcode")
                .attempt(2),
        )
        .unwrap();

    (done.id, active.id)
}

#[tokio::test]
async fn test_from_config_runs_configured_pipelines() {
    let temp = TempDir::new().unwrap();
    let config = load_config(write_config(temp.path())).unwrap();
    let orchestrator = Arc::new(Orchestrator::from_config(&config, &catalog()).unwrap());

    let mut names = orchestrator.health().pipelines;
    names.sort();
    assert_eq!(names, vec!["article", "video"]);

    let outcome = orchestrator
        .submit(
            Fingerprint::of_url("https://news.example/story").unwrap(),
            serde_json::json!({ "url": "https://news.example/story" }),
            "article",
        )
        .await
        .unwrap();
    let mut subscription = orchestrator.subscribe(&outcome.job_id).unwrap();
    while subscription.next().await.is_some() {}

    let job = orchestrator.status(&outcome.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(temp.path().join("data").join("jobflow.db").exists());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_restart_fails_interrupted_jobs_and_restores_dedup() {
    let temp = TempDir::new().unwrap();
    let config_path = write_config(temp.path());
    let (done, interrupted) = seed_previous_run(&temp.path().join("data").join("jobflow.db"));

    let config = load_config(&config_path).unwrap();
    let orchestrator = Orchestrator::from_config(&config, &catalog()).unwrap();

    let job = orchestrator.status(&interrupted).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("interruption recorded");
    assert_eq!(error.kind, FailureKind::Interrupted);
    assert_eq!(error.stage_index, Some(1));
    assert_eq!(error.attempts, 2);
    assert_eq!(job.progress, 30.0);

    assert_eq!(
        orchestrator.result(&done).unwrap().as_str(),
        "summaries/a"
    );
    let again = orchestrator
        .submit(
            Fingerprint::new("https://news.example/a"),
            serde_json::json!({}),
            "article",
        )
        .await
        .unwrap();
    assert!(again.attached);
    assert_eq!(again.job_id, done);

    let retried = orchestrator
        .submit(
            Fingerprint::new("https://videos.example/v/9"),
            serde_json::json!({}),
            "video",
        )
        .await
        .unwrap();
    assert!(!retried.attached);
    assert_ne!(retried.job_id, interrupted);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_artifacts_survive_restart() {
    let temp = TempDir::new().unwrap();
    let config_path = write_config(temp.path());
    let config = load_config(&config_path).unwrap();

    let first = Orchestrator::from_config(&config, &catalog()).unwrap();
    let artifact = first
        .store_artifact(b"poster", "poster.jpg", None, None)
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = Orchestrator::from_config(&config, &catalog()).unwrap();
    let restored = second.artifacts().get(&artifact.id).expect("artifact restored");
    assert_eq!(restored.location, artifact.location);
    assert!(Path::new(&restored.location).starts_with(temp.path().join("artifacts")));
    second.shutdown().await;
}

#[test]
fn test_invalid_pipeline_weights_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{ "version": "1.0", "pipelines": { "video": { "stages": [
            { "name": "fetch", "weight": 30 },
            { "name": "publish", "weight": 30 }
        ] } } }"#,
    )
    .unwrap();

    let err = load_config(&path).unwrap_err();
    assert!(matches!(err, jobflow::ConfigError::InvalidPipeline { .. }));
}
