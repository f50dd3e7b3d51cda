//! Artifact repository: persistence for the `artifacts` table.

use rusqlite::{params, Row};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::artifacts::Artifact;
use crate::job::JobId;

#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub id: String,
    pub location: String,
    pub job_id: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl ArtifactRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            location: row.get("location")?,
            job_id: row.get("job_id")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    pub fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            id: artifact.id.clone(),
            location: artifact.location.clone(),
            job_id: artifact.job_id.as_ref().map(|id| id.to_string()),
            created_at: format_timestamp(artifact.created_at),
            expires_at: format_timestamp(artifact.expires_at),
        }
    }

    pub fn into_artifact(self) -> Artifact {
        Artifact {
            created_at: parse_timestamp(&self.created_at),
            expires_at: parse_timestamp(&self.expires_at),
            id: self.id,
            location: self.location,
            job_id: self.job_id.map(JobId::from),
        }
    }
}

pub fn insert(db: &Database, artifact: &ArtifactRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO artifacts (id, location, job_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                artifact.id,
                artifact.location,
                artifact.job_id,
                artifact.created_at,
                artifact.expires_at,
            ],
        )?;
        Ok(())
    })
}

/// Deletes an artifact row. Returns true if a row was removed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM artifacts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    })
}

/// Loads every artifact, earliest expiry first.
pub fn load_all(db: &Database) -> Result<Vec<ArtifactRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM artifacts ORDER BY expires_at ASC")?;
        let rows = stmt
            .query_map([], ArtifactRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sample(id: &str, ttl_secs: i64) -> Artifact {
        let now = Utc::now();
        Artifact {
            id: id.to_string(),
            location: format!("/tmp/uploads/{id}.pdf"),
            job_id: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_insert_load_delete() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &ArtifactRow::from_artifact(&sample("late", 600))).unwrap();
        insert(&db, &ArtifactRow::from_artifact(&sample("early", 60))).unwrap();

        let rows = load_all(&db).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "early");

        assert!(delete(&db, "early").unwrap());
        assert!(!delete(&db, "early").unwrap());
        assert_eq!(load_all(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_row_round_trip_keeps_owner() {
        let mut artifact = sample("a1", 60);
        artifact.job_id = Some(JobId::from("job-1"));
        let restored = ArtifactRow::from_artifact(&artifact).into_artifact();
        assert_eq!(restored, artifact);
    }
}
