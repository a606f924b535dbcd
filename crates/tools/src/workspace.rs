//! Scoped scratch directories.

use benchman_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A scratch directory that exists exactly as long as this value.
///
/// Acquiring wipes whatever a previous run left at the path; dropping removes
/// the tree on success, error and cancellation alike.
#[derive(Debug)]
pub struct ScopedWorkspace {
    path: PathBuf,
}

impl ScopedWorkspace {
    /// Create a fresh, empty directory at `path`.
    pub async fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if fs::try_exists(&path).await? {
            tracing::debug!(path = %path.display(), "removing stale workspace");
            if let Err(e) = fs::remove_dir_all(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to clear stale workspace");
            }
        }
        fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    /// Path of the workspace.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "workspace cleanup failed");
            }
        }
    }
}
