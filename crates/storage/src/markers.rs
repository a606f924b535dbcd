//! Finish markers.
//!
//! A marker is an empty-ish file whose existence records that a unit of work
//! completed. Content is never read back. Markers are only removed by the
//! operator (`prepare --reinstall`, deleting a results dir).

use benchman_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Content written into completion markers.
const FINISHED_CONTENT: &str = "FIN";

/// Kinds of marker files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FinishMarker {
    /// `.finished` - a sub-project completed all its steps
    Finished,
    /// `.finished_<n>` - step `n` of a phase list completed
    Step(usize),
    /// `.skip` - excluded by the allow/deny lists
    Skip,
    /// `.finished_prepare_package_all` - sources fetched and installed
    PrepareAll,
    /// Custom marker file name supplied by a step
    Named(String),
}

impl FinishMarker {
    /// File name of the marker.
    pub fn file_name(&self) -> String {
        match self {
            FinishMarker::Finished => ".finished".to_string(),
            FinishMarker::Step(n) => format!(".finished_{n}"),
            FinishMarker::Skip => ".skip".to_string(),
            FinishMarker::PrepareAll => ".finished_prepare_package_all".to_string(),
            FinishMarker::Named(name) => name.clone(),
        }
    }

    fn content(&self) -> &'static str {
        match self {
            FinishMarker::Skip => "",
            _ => FINISHED_CONTENT,
        }
    }
}

/// The markers of one directory.
#[derive(Debug, Clone)]
pub struct MarkerDir {
    dir: PathBuf,
}

impl MarkerDir {
    /// Markers stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the markers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `marker`.
    pub fn path(&self, marker: &FinishMarker) -> PathBuf {
        self.dir.join(marker.file_name())
    }

    /// Whether `marker` exists.
    pub async fn contains(&self, marker: &FinishMarker) -> bool {
        fs::try_exists(self.path(marker)).await.unwrap_or(false)
    }

    /// Create `marker`, creating the directory if needed.
    pub async fn mark(&self, marker: &FinishMarker) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.path(marker), marker.content()).await?;
        tracing::debug!(marker = %self.path(marker).display(), "marked");
        Ok(())
    }

    /// Whether the unit is finished or was intentionally skipped.
    pub async fn is_settled(&self) -> bool {
        self.contains(&FinishMarker::Finished).await || self.contains(&FinishMarker::Skip).await
    }
}
