//! Task database files.
//!
//! A task database is a JSON array of tagged task objects:
//!
//! ```json
//! [{"type": "npm", "name": "left-pad", "version": "1.3.0"},
//!  {"type": "git", "repo": "owner/name", "commitId": "abc123"}]
//! ```

use benchman_core::{BenchError, Result, Task};
use std::path::Path;
use tokio::fs;

/// Read every task of a database file.
///
/// A file that is not a JSON array of known task objects is a
/// [`BenchError::MalformedDescriptor`].
pub async fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let text = fs::read_to_string(path).await?;
    let tasks: Vec<Task> = serde_json::from_str(&text)
        .map_err(|e| BenchError::malformed(path.display().to_string(), e))?;
    tracing::debug!(db = %path.display(), count = tasks.len(), "loaded task database");
    Ok(tasks)
}

/// Read an optional task list such as an allow or deny list.
pub async fn read_task_list(path: Option<&Path>) -> Result<Option<Vec<Task>>> {
    match path {
        Some(path) => read_tasks(path).await.map(Some),
        None => Ok(None),
    }
}

/// Write tasks as a database file.
pub async fn write_tasks(path: &Path, tasks: &[Task]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(tasks)?;
    fs::write(path, json.as_bytes()).await?;
    Ok(())
}
