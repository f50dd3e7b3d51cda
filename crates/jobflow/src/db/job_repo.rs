//! Job repository: persistence for the `jobs` table.

use rusqlite::{params, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::fingerprint::Fingerprint;
use crate::job::{ErrorDetail, Job, JobId, JobStatus, ResultRef, StageRecord};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub fingerprint: String,
    pub pipeline: String,
    pub status: String,
    pub progress: f64,
    pub current_stage: i64,
    pub stage_name: Option<String>,
    pub attempt: i64,
    pub message: String,
    pub input: String,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub stages: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            fingerprint: row.get("fingerprint")?,
            pipeline: row.get("pipeline")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            current_stage: row.get("current_stage")?,
            stage_name: row.get("stage_name")?,
            attempt: row.get("attempt")?,
            message: row.get("message")?,
            input: row.get("input")?,
            result_ref: row.get("result_ref")?,
            error: row.get("error")?,
            stages: row.get("stages")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    pub fn from_job(job: &Job) -> Result<Self, DatabaseError> {
        let encode = |what: &str, value: Result<String, serde_json::Error>| {
            value.map_err(|e| DatabaseError::CorruptRow {
                table: "jobs",
                id: job.id.to_string(),
                reason: format!("cannot encode {what}: {e}"),
            })
        };

        Ok(Self {
            id: job.id.to_string(),
            fingerprint: job.fingerprint.to_string(),
            pipeline: job.pipeline.clone(),
            status: job.status.as_str().to_string(),
            progress: job.progress,
            current_stage: job.current_stage as i64,
            stage_name: job.stage_name.clone(),
            attempt: i64::from(job.attempt),
            message: job.message.clone(),
            input: encode("input", serde_json::to_string(&job.input))?,
            result_ref: job.result.as_ref().map(|r| r.to_string()),
            error: job
                .error
                .as_ref()
                .map(|e| encode("error", serde_json::to_string(e)))
                .transpose()?,
            stages: encode("stages", serde_json::to_string(&job.stages))?,
            created_at: format_timestamp(job.created_at),
            updated_at: format_timestamp(job.updated_at),
            completed_at: job.completed_at.map(format_timestamp),
        })
    }

    pub fn into_job(self) -> Result<Job, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            table: "jobs",
            id: self.id.clone(),
            reason,
        };

        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let input: serde_json::Value = serde_json::from_str(&self.input)
            .map_err(|e| corrupt(format!("invalid input JSON: {e}")))?;
        let error = self
            .error
            .as_deref()
            .map(serde_json::from_str::<ErrorDetail>)
            .transpose()
            .map_err(|e| corrupt(format!("invalid error JSON: {e}")))?;
        let stages: Vec<StageRecord> = serde_json::from_str(&self.stages)
            .map_err(|e| corrupt(format!("invalid stages JSON: {e}")))?;

        Ok(Job {
            id: JobId::from(self.id.clone()),
            fingerprint: Fingerprint::new(self.fingerprint.clone()),
            pipeline: self.pipeline.clone(),
            status,
            progress: self.progress,
            current_stage: usize::try_from(self.current_stage).unwrap_or_default(),
            stage_name: self.stage_name.clone(),
            attempt: u32::try_from(self.attempt).unwrap_or_default(),
            message: self.message.clone(),
            input,
            result: self.result_ref.clone().map(ResultRef::new),
            error,
            stages,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
            completed_at: self.completed_at.as_deref().map(parse_timestamp),
        })
    }
}

/// Inserts a job row, or overwrites every mutable column if it exists.
pub fn upsert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, fingerprint, pipeline, status, progress, current_stage,
             stage_name, attempt, message, input, result_ref, error, stages, created_at,
             updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET status=excluded.status, progress=excluded.progress,
             current_stage=excluded.current_stage, stage_name=excluded.stage_name,
             attempt=excluded.attempt, message=excluded.message, result_ref=excluded.result_ref,
             error=excluded.error, stages=excluded.stages, updated_at=excluded.updated_at,
             completed_at=excluded.completed_at",
            params![
                job.id,
                job.fingerprint,
                job.pipeline,
                job.status,
                job.progress,
                job.current_stage,
                job.stage_name,
                job.attempt,
                job.message,
                job.input,
                job.result_ref,
                job.error,
                job.stages,
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Loads every job, oldest first.
pub fn load_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
