//! Directory layout of the package cache, results and scratch trees.
//!
//! ```text
//! <packages>/<canonical_name>/<canonical_version>/          fetched sources
//! <results>/<label>/<canonical_name>/<canonical_version>/   artifacts, logs, markers
//! <scratch>/<label>/<canonical_name>/<canonical_version>/   per-run scratch
//! ```

use benchman_core::{Config, Result, Task, SUB_DELIMITER};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Roots of the three storage trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    packages: PathBuf,
    results: PathBuf,
    scratch: PathBuf,
}

/// A `<name>/<version>` entry below a label's results directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    /// Canonical name
    pub name: String,
    /// Canonical version
    pub version: String,
    /// Full path of the entry
    pub path: PathBuf,
}

impl Layout {
    /// Layout with explicit roots.
    pub fn new(
        packages: impl Into<PathBuf>,
        results: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            packages: packages.into(),
            results: results.into(),
            scratch: scratch.into(),
        }
    }

    /// Layout described by a configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.packages_dir, &config.results_dir, &config.scratch_dir)
    }

    /// Package cache root.
    pub fn packages_root(&self) -> &Path {
        &self.packages
    }

    /// Results root.
    pub fn results_root(&self) -> &Path {
        &self.results
    }

    /// Scratch root.
    pub fn scratch_root(&self) -> &Path {
        &self.scratch
    }

    /// Sources of `task`.
    pub fn package_dir(&self, task: &Task) -> PathBuf {
        task.dir(&self.packages)
    }

    /// Version directory of the top-level package `task` belongs to.
    pub fn package_version_dir(&self, task: &Task) -> PathBuf {
        self.packages
            .join(task.canonical_name())
            .join(task.root_version())
    }

    /// `<results>/<label>`
    pub fn label_results(&self, label: &str) -> PathBuf {
        self.results.join(label)
    }

    /// `<results>/<label>/<name>/<version>`
    pub fn result_dir(&self, label: &str, task: &Task) -> PathBuf {
        self.label_results(label)
            .join(task.canonical_name())
            .join(task.canonical_version())
    }

    /// `<scratch>/<label>`
    pub fn label_scratch(&self, label: &str) -> PathBuf {
        self.scratch.join(label)
    }

    /// `<scratch>/<label>/<name>/<version>`
    pub fn scratch_dir(&self, label: &str, task: &Task) -> PathBuf {
        self.label_scratch(label)
            .join(task.canonical_name())
            .join(task.canonical_version())
    }

    /// Result entries of a label whose version matches `pattern`.
    ///
    /// Without a pattern only top-level entries are listed, sub-project
    /// versions (which contain the sub-task delimiter) are skipped.
    pub async fn result_entries(
        &self,
        label: &str,
        pattern: Option<&Regex>,
    ) -> Result<Vec<ResultEntry>> {
        let root = self.label_results(label);
        let mut entries = Vec::new();
        if !fs::try_exists(&root).await? {
            return Ok(entries);
        }

        let mut names = fs::read_dir(&root).await?;
        while let Some(name_entry) = names.next_entry().await? {
            if !name_entry.file_type().await?.is_dir() {
                continue;
            }
            let name = name_entry.file_name().to_string_lossy().into_owned();
            let mut versions = fs::read_dir(name_entry.path()).await?;
            while let Some(version_entry) = versions.next_entry().await? {
                if !version_entry.file_type().await?.is_dir() {
                    continue;
                }
                let version = version_entry.file_name().to_string_lossy().into_owned();
                let keep = match pattern {
                    Some(re) => re.is_match(&version),
                    None => !version.starts_with('/') && !version.contains(SUB_DELIMITER),
                };
                if keep {
                    entries.push(ResultEntry {
                        name: name.clone(),
                        version,
                        path: version_entry.path(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(entries)
    }
}
