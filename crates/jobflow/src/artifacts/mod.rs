//! Transient artifacts: short-lived resources produced around jobs and
//! deleted by the cleanup sweeper once they expire.

mod storage;

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use storage::{ArtifactStorage, FsArtifactStorage};

use crate::db::artifact_repo::{self, ArtifactRow};
use crate::db::{Database, DatabaseError};
use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub location: String,
    /// Owning job, if any. Expiry does not depend on the job's status.
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Artifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<String, Artifact>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl Index {
    fn insert(&mut self, artifact: Artifact) {
        self.by_expiry
            .insert((artifact.expires_at, artifact.id.clone()));
        self.by_id.insert(artifact.id.clone(), artifact);
    }

    fn remove(&mut self, id: &str) -> Option<Artifact> {
        let artifact = self.by_id.remove(id)?;
        self.by_expiry
            .remove(&(artifact.expires_at, artifact.id.clone()));
        Some(artifact)
    }
}

/// Registry of transient artifacts ordered by expiry.
pub struct ArtifactRegistry {
    index: Mutex<Index>,
    db: RwLock<Option<Database>>,
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(Index::default()),
            db: RwLock::new(None),
        }
    }

    pub fn set_database(&self, db: Database) {
        match self.db.write() {
            Ok(mut g) => *g = Some(db),
            Err(poisoned) => {
                tracing::warn!("Artifact registry DB lock was poisoned, recovering");
                *poisoned.into_inner() = Some(db);
            }
        }
    }

    fn database(&self) -> Option<Database> {
        match self.db.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        match self.index.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Artifact registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Records an artifact that expires `ttl` from now.
    pub fn register(
        &self,
        location: impl Into<String>,
        job_id: Option<JobId>,
        ttl: Duration,
    ) -> Artifact {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.insert(Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            location: location.into(),
            job_id,
            created_at: now,
            expires_at,
        })
    }

    /// Records an artifact with an explicit expiry.
    pub fn register_with_expiry(
        &self,
        location: impl Into<String>,
        job_id: Option<JobId>,
        expires_at: DateTime<Utc>,
    ) -> Artifact {
        self.insert(Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            location: location.into(),
            job_id,
            created_at: Utc::now(),
            expires_at,
        })
    }

    fn insert(&self, artifact: Artifact) -> Artifact {
        if let Some(db) = self.database() {
            if let Err(e) = artifact_repo::insert(&db, &ArtifactRow::from_artifact(&artifact)) {
                tracing::error!(artifact_id = %artifact.id, "Failed to persist artifact: {}", e);
            }
        }
        self.lock().insert(artifact.clone());
        tracing::debug!(
            artifact_id = %artifact.id,
            expires_at = %artifact.expires_at,
            "Artifact registered"
        );
        artifact
    }

    /// Artifacts with `expires_at <= now`, oldest expiry first.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Artifact> {
        self.due_after(now, None, limit)
    }

    /// Like [`ArtifactRegistry::due`], resuming strictly after `after` in
    /// expiry order. `after` need not still be registered.
    pub fn due_after(
        &self,
        now: DateTime<Utc>,
        after: Option<&Artifact>,
        limit: usize,
    ) -> Vec<Artifact> {
        let start = match after {
            Some(a) => Bound::Excluded((a.expires_at, a.id.clone())),
            None => Bound::Unbounded,
        };
        let index = self.lock();
        index
            .by_expiry
            .range((start, Bound::Unbounded))
            .take_while(|(expires_at, _)| *expires_at <= now)
            .take(limit)
            .filter_map(|(_, id)| index.by_id.get(id).cloned())
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<Artifact> {
        let removed = self.lock().remove(id);
        if removed.is_some() {
            if let Some(db) = self.database() {
                if let Err(e) = artifact_repo::delete(&db, id) {
                    tracing::error!(artifact_id = %id, "Failed to delete artifact row: {}", e);
                }
            }
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn for_job(&self, job_id: &JobId) -> Vec<Artifact> {
        let index = self.lock();
        index
            .by_expiry
            .iter()
            .filter_map(|(_, id)| index.by_id.get(id))
            .filter(|a| a.job_id.as_ref() == Some(job_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    /// Restores artifact records from the database. Returns the number loaded.
    pub fn load_from_database(&self) -> Result<usize, DatabaseError> {
        let Some(db) = self.database() else {
            return Ok(0);
        };
        let rows = artifact_repo::load_all(&db)?;
        let mut index = self.lock();
        let mut loaded = 0;
        for row in rows {
            if !index.by_id.contains_key(&row.id) {
                index.insert(row.into_artifact());
                loaded += 1;
            }
        }
        tracing::info!("Loaded {} artifacts from database", loaded);
        Ok(loaded)
    }
}
