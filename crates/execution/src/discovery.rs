//! Sub-project discovery.
//!
//! Registry and repository tasks are scanned breadth-first for nested
//! `package.json` files; installed dependencies and VCS metadata are never
//! entered. URL and local tasks treat each immediate child entry as one
//! sub-project.

use benchman_core::{Result, SubTask, Task};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Project descriptor file looked for while scanning.
pub const PROJECT_DESCRIPTOR: &str = "package.json";

/// Directories never descended into.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git"];

/// A discovered sub-project.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    /// Descriptor file, or the child entry for URL and local tasks
    pub source: PathBuf,
    /// The sub-project as a task
    pub task: Task,
}

/// Discover at most `limit` sub-projects of `task`, whose sources live in `root`.
///
/// Results are de-duplicated by identity and ordered by scan order, with
/// directory entries visited in name order.
pub async fn discover(task: &Task, root: &Path, limit: usize) -> Result<Vec<Discovered>> {
    match task {
        Task::Registry { .. } | Task::Repository { .. } => scan_descriptors(task, root, limit).await,
        Task::Url { .. } | Task::Local { .. } => immediate_children(task, root, limit).await,
        _ => Ok(Vec::new()),
    }
}

async fn scan_descriptors(task: &Task, root: &Path, limit: usize) -> Result<Vec<Discovered>> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let entries = match sorted_entries(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for (path, is_dir) in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_dir {
                if !EXCLUDED_DIRS.contains(&name) {
                    queue.push_back(path);
                }
                continue;
            }
            if name != PROJECT_DESCRIPTOR {
                continue;
            }
            let Some((sub_name, mut sub_version)) = read_descriptor(&path).await else {
                continue;
            };
            if dir == root {
                sub_version.push_str("#root");
            }
            let sub = Task::Sub(SubTask::new(task.clone(), sub_name, sub_version, Some(dir.clone())));
            if !seen.insert(sub.clone()) {
                continue;
            }
            if found.len() >= limit {
                tracing::info!(task = %task, limit, "sub-project limit reached, skipping the rest");
                return Ok(found);
            }
            found.push(Discovered { source: path, task: sub });
        }
    }
    Ok(found)
}

async fn immediate_children(task: &Task, root: &Path, limit: usize) -> Result<Vec<Discovered>> {
    if !fs::try_exists(root).await? {
        return Ok(Vec::new());
    }
    let entries = sorted_entries(root).await?;
    if entries.len() > limit {
        tracing::info!(task = %task, limit, "sub-project limit reached, skipping the rest");
    }
    Ok(entries
        .into_iter()
        .take(limit)
        .filter_map(|(path, _)| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let sub = Task::Sub(SubTask::new(task.clone(), name, "", Some(path.clone())));
            Some(Discovered { source: path, task: sub })
        })
        .collect())
}

/// Entries of `dir` sorted by name, with a flag for real (non-symlink) directories.
async fn sorted_entries(dir: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
    let mut entries = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push((entry.path(), is_dir));
    }
    entries.sort();
    Ok(entries)
}

/// `(name, version)` of a descriptor; unnamed projects are named by content hash.
async fn read_descriptor(path: &Path) -> Option<(String, String)> {
    let text = fs::read_to_string(path).await.ok()?;
    let json: serde_json::Value = match serde_json::from_str(&text) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(descriptor = %path.display(), error = %e, "malformed project descriptor");
            return None;
        }
    };
    let version = json
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("null")
        .to_string();
    match json.get("name").and_then(|n| n.as_str()) {
        Some(name) if !name.is_empty() => Some((name.to_string(), version)),
        _ => {
            let digest = format!("{:x}", md5::compute(text.as_bytes()));
            Some((digest[..20].to_string(), "null".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn sub_parts(task: &Task) -> (&str, &str) {
        match task {
            Task::Sub(sub) => (sub.sub_name.as_str(), sub.sub_version.as_str()),
            other => panic!("not a sub-task: {other}"),
        }
    }

    #[tokio::test]
    async fn test_scan_skips_dependency_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name": "mono", "version": "1.0.0"}"#);
        write(&root.join("packages/a/package.json"), r#"{"name": "@mono/a", "version": "0.1.0"}"#);
        write(&root.join("packages/b/package.json"), r#"{"name": "@mono/b"}"#);
        write(&root.join("node_modules/dep/package.json"), r#"{"name": "dep", "version": "9.9.9"}"#);
        write(&root.join("packages/a/node_modules/x/package.json"), r#"{"name": "x"}"#);
        write(&root.join(".git/package.json"), r#"{"name": "git"}"#);

        let task = Task::repository("o/mono", "abc");
        let found = discover(&task, root, 100).await.unwrap();
        let parts: Vec<_> = found.iter().map(|d| sub_parts(&d.task)).collect();
        assert_eq!(
            parts,
            vec![("mono", "1.0.0#root"), ("@mono/a", "0.1.0"), ("@mono/b", "null")]
        );
        for d in &found {
            assert!(!d.source.components().any(|c| c.as_os_str() == "node_modules"));
        }
        assert_eq!(found[1].task.dir(Path::new("/unused")), root.join("packages/a"));
    }

    #[tokio::test]
    async fn test_scan_respects_limit() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            write(
                &dir.path().join(format!("p{i}/package.json")),
                &format!(r#"{{"name": "p{i}", "version": "1.0.0"}}"#),
            );
        }
        let task = Task::registry("many", "1.0.0");
        let found = discover(&task, dir.path(), 3).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(sub_parts(&found[2].task).0, "p2");
    }

    #[tokio::test]
    async fn test_unnamed_and_malformed_descriptors() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("a/package.json"), r#"{"private": true}"#);
        write(&dir.path().join("b/package.json"), "{ not json");

        let task = Task::registry("x", "1.0.0");
        let found = discover(&task, dir.path(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        let (name, version) = sub_parts(&found[0].task);
        assert_eq!(name.len(), 20);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(version, "null");
    }

    #[tokio::test]
    async fn test_duplicate_identities_collapse() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("a/package.json"), r#"{"name": "same", "version": "1"}"#);
        write(&dir.path().join("b/package.json"), r#"{"name": "same", "version": "1"}"#);

        let task = Task::registry("x", "1.0.0");
        let found = discover(&task, dir.path(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_url_children() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("page1/index.js"), "");
        write(&dir.path().join("page2.js"), "");

        let task = Task::url("https://example.com/site");
        let found = discover(&task, dir.path(), 10).await.unwrap();
        let names: Vec<_> = found.iter().map(|d| sub_parts(&d.task).0).collect();
        assert_eq!(names, vec!["page1", "page2.js"]);

        let capped = discover(&task, dir.path(), 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_root_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let task = Task::registry("x", "1.0.0");
        assert!(discover(&task, &missing, 10).await.unwrap().is_empty());
        assert!(discover(&Task::local("l"), &missing, 10).await.unwrap().is_empty());
    }
}
