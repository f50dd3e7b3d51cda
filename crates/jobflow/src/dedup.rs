//! Fingerprint to job index.
//!
//! A pure associative index: callers compute fingerprints and decide when
//! entries go away. Retention of completed jobs is enforced by the
//! cleanup sweeper.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::DedupError;
use crate::fingerprint::Fingerprint;
use crate::job::JobId;

#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub job_id: JobId,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct DedupIndex {
    entries: Mutex<HashMap<Fingerprint, DedupEntry>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, DedupEntry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Dedup index lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the job currently holding `fingerprint`.
    pub fn resolve(&self, fingerprint: &Fingerprint) -> Option<JobId> {
        self.lock().get(fingerprint).map(|e| e.job_id.clone())
    }

    /// Associates `fingerprint` with `job_id`.
    ///
    /// Registering the same pair twice is a no-op. A different holder is
    /// never overwritten.
    pub fn register(&self, fingerprint: Fingerprint, job_id: JobId) -> Result<(), DedupError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&fingerprint) {
            if existing.job_id == job_id {
                return Ok(());
            }
            return Err(DedupError::AlreadyRegistered {
                fingerprint,
                holder: existing.job_id.clone(),
            });
        }
        entries.insert(
            fingerprint,
            DedupEntry {
                job_id,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Removes the entry only if it still points at `job_id`.
    pub fn release(&self, fingerprint: &Fingerprint, job_id: &JobId) -> bool {
        let mut entries = self.lock();
        match entries.get(fingerprint) {
            Some(entry) if &entry.job_id == job_id => {
                entries.remove(fingerprint);
                tracing::debug!(fingerprint = %fingerprint, job_id = %job_id, "Released dedup entry");
                true
            }
            _ => false,
        }
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<DedupEntry> {
        self.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
