use crate::domain::IngestError;
use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An uploaded file found under the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Absolute path, always a direct child of the storage root
    pub path: PathBuf,
    /// Base name the path was built from
    pub stored_name: String,
    /// File size when it was resolved
    pub size: u64,
}

/// Maps stored file names onto a single storage root.
///
/// Only the final component of a stored name is ever joined onto the root.
/// A symlink entry is accepted only when its target is a regular file inside
/// the root, so resolution cannot reach outside it.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    root: PathBuf,
}

impl ArtifactResolver {
    /// Canonicalizes `root`, which must be an existing directory
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("failed to canonicalize storage root {}", root.display()))?;

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .with_context(|| format!("failed to stat storage root {}", canonical.display()))?;
        if !metadata.is_dir() {
            bail!("storage root {} is not a directory", canonical.display());
        }

        debug!(root = %canonical.display(), "artifact resolver ready");
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reduces a stored name to its final path component.
    ///
    /// Separators are the platform's (`/` on unix, `/` and `\` on windows),
    /// and trailing separators are ignored. Fails when nothing usable is left.
    pub fn sanitize(stored_name: &str) -> Result<&str, IngestError> {
        let invalid = || IngestError::InvalidStoredName(stored_name.to_string());

        if stored_name.contains('\0') {
            return Err(invalid());
        }

        let base = stored_name
            .trim_end_matches(std::path::is_separator)
            .rsplit(std::path::is_separator)
            .next()
            .unwrap_or_default();

        match base {
            "" | "." | ".." => Err(invalid()),
            base => Ok(base),
        }
    }

    /// Resolves a stored name to a regular file directly under the root
    pub async fn resolve(&self, stored_name: &str) -> Result<ResolvedArtifact, IngestError> {
        let base = Self::sanitize(stored_name)?;
        let path = self.root.join(base);

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(IngestError::ArtifactNotFound { path });
            }
            Err(source) => return Err(IngestError::ReadFailure { path, source }),
        };

        let size = if metadata.file_type().is_symlink() {
            self.symlink_target_size(&path).await?
        } else if metadata.file_type().is_file() {
            metadata.len()
        } else {
            debug!(path = %path.display(), "stored name is not a regular file");
            return Err(IngestError::ArtifactNotFound { path });
        };

        Ok(ResolvedArtifact {
            path,
            stored_name: base.to_string(),
            size,
        })
    }

    /// Size of a symlink's target, which must be a regular file inside the root
    async fn symlink_target_size(&self, path: &Path) -> Result<u64, IngestError> {
        let not_found = || IngestError::ArtifactNotFound {
            path: path.to_path_buf(),
        };
        let read_failure = |source| IngestError::ReadFailure {
            path: path.to_path_buf(),
            source,
        };

        let target = match tokio::fs::canonicalize(path).await {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(source) => return Err(read_failure(source)),
        };

        if !target.starts_with(&self.root) {
            warn!(
                path = %path.display(),
                target = %target.display(),
                "symlink points outside the storage root"
            );
            return Err(not_found());
        }

        match tokio::fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => {
                debug!(path = %path.display(), "symlink target is not a regular file");
                Err(not_found())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(source) => Err(read_failure(source)),
        }
    }
}
