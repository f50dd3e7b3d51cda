use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::ArtifactError;

/// Backing store for transient artifacts.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Writes `bytes` and returns the location to record. `hint` is a file
    /// name whose extension is kept.
    async fn store(&self, bytes: &[u8], hint: &str) -> Result<String, ArtifactError>;

    /// Deletes the resource at `location`. A missing resource is not an error.
    async fn delete(&self, location: &str) -> Result<(), ArtifactError>;
}

/// Stores artifacts as files under a root directory.
pub struct FsArtifactStorage {
    root: PathBuf,
}

impl FsArtifactStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(hint: &str) -> String {
        let id = uuid::Uuid::new_v4();
        let extension = Path::new(hint)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()));
        match extension {
            Some(ext) => format!("{}.{}", id, ext.to_ascii_lowercase()),
            None => id.to_string(),
        }
    }

    /// Resolves `location` and checks that it stays under the root.
    fn resolve(&self, location: &str) -> Result<PathBuf, ArtifactError> {
        let path = PathBuf::from(location);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(ArtifactError::OutsideRoot(location.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn store(&self, bytes: &[u8], hint: &str) -> Result<String, ArtifactError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ArtifactError::Write {
                path: self.root.clone(),
                source: e,
            })?;

        let path = self.root.join(Self::file_name(hint));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArtifactError::Write {
                path: path.clone(),
                source: e,
            })?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Stored artifact");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn delete(&self, location: &str) -> Result<(), ArtifactError> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Artifact already gone");
                Ok(())
            }
            Err(e) => Err(ArtifactError::Delete { path, source: e }),
        }
    }
}
