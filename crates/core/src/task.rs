//! Task model - the addressable unit of benchmark work.
//!
//! A task's identity is the pair `(canonical_name, canonical_version)`. Both
//! halves are filesystem-safe and are used verbatim as the cache key below the
//! packages root and as the results key below `<results>/<label>/`.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Sub-project names keep at most this many trailing characters.
pub const SUB_NAME_MAX: usize = 35;

/// Sub-project versions keep at most this many trailing characters.
pub const SUB_VERSION_MAX: usize = 12;

/// Separator between the parent version and the sub-project parts.
pub const SUB_DELIMITER: &str = "##";

/// A unit of analysis work.
///
/// Serialized as a tagged union keyed by `"type"`, which is the format of the
/// task database files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    /// A package version published to the registry
    #[serde(rename = "npm")]
    Registry {
        /// Package name, possibly scoped (`@scope/name`)
        name: String,
        /// Exact version
        version: String,
    },

    /// A repository pinned at a commit
    #[serde(rename = "git")]
    Repository {
        /// `owner/name`
        repo: String,
        /// Commit hash
        #[serde(rename = "commitId")]
        commit: String,
    },

    /// An installed module below `<packages>/node_modules`
    #[serde(rename = "module")]
    Module {
        /// Module name
        name: String,
    },

    /// A remote location, e.g. a crawled site
    #[serde(rename = "url")]
    Url {
        /// Full URL
        url: String,
    },

    /// A directory already present below the packages root
    #[serde(rename = "local")]
    Local {
        /// Directory relative to the packages root
        dir: String,
    },

    /// A project nested inside another task
    #[serde(rename = "subtask")]
    Sub(SubTask),
}

/// A project discovered inside a parent task's directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// The enclosing task
    pub task: Box<Task>,

    /// Name from the nested project descriptor
    #[serde(rename = "subName")]
    pub sub_name: String,

    /// Version from the nested project descriptor
    #[serde(rename = "subVersion")]
    pub sub_version: String,

    /// Directory holding the nested project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl SubTask {
    /// Create a sub-task of `parent`.
    pub fn new(
        parent: Task,
        sub_name: impl Into<String>,
        sub_version: impl Into<String>,
        dir: Option<PathBuf>,
    ) -> Self {
        Self {
            task: Box::new(parent),
            sub_name: sub_name.into(),
            sub_version: sub_version.into(),
            dir,
        }
    }

    /// Version suffix appended to the parent's version.
    ///
    /// Equality, hashing and directory naming all go through this single
    /// function, so two sub-tasks compare equal exactly when they share a
    /// results directory.
    pub fn version_suffix(&self) -> String {
        let name = self.sub_name.replace('/', "#");
        let version = self.sub_version.replace('/', "#");
        format!(
            "{SUB_DELIMITER}{}{SUB_DELIMITER}{}",
            tail_chars(&name, SUB_NAME_MAX),
            tail_chars(&version, SUB_VERSION_MAX)
        )
    }
}

impl Task {
    /// Registry package `name@version`.
    pub fn registry(name: impl Into<String>, version: impl Into<String>) -> Self {
        Task::Registry {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Repository `repo` at `commit`.
    pub fn repository(repo: impl Into<String>, commit: impl Into<String>) -> Self {
        Task::Repository {
            repo: repo.into(),
            commit: commit.into(),
        }
    }

    /// Remote location.
    pub fn url(url: impl Into<String>) -> Self {
        Task::Url { url: url.into() }
    }

    /// Directory below the packages root.
    pub fn local(dir: impl Into<String>) -> Self {
        Task::Local { dir: dir.into() }
    }

    /// Filesystem-safe name half of the identity.
    pub fn canonical_name(&self) -> String {
        match self {
            Task::Registry { name, .. } | Task::Module { name } => name.replace('/', "__"),
            Task::Repository { repo, .. } => repo.replace('/', "__"),
            Task::Url { url } => {
                let parts = UrlParts::parse(url);
                format!("{}:{}", parts.scheme, parts.host)
            }
            Task::Local { dir } => dir.clone(),
            Task::Sub(sub) => sub.task.canonical_name(),
        }
    }

    /// Filesystem-safe version half of the identity.
    pub fn canonical_version(&self) -> String {
        match self {
            Task::Registry { version, .. } => version.clone(),
            Task::Repository { commit, .. } => commit.clone(),
            Task::Module { .. } | Task::Local { .. } => "0".to_string(),
            Task::Url { url } => {
                let path = UrlParts::parse(url).path.trim_start_matches('/');
                if path.is_empty() {
                    "root".to_string()
                } else {
                    path.replace('/', "#")
                }
            }
            Task::Sub(sub) => format!("{}{}", sub.task.canonical_version(), sub.version_suffix()),
        }
    }

    /// On-disk location of the task's sources.
    pub fn dir(&self, packages_root: &Path) -> PathBuf {
        match self {
            Task::Registry { .. } | Task::Repository { .. } | Task::Url { .. } => packages_root
                .join(self.canonical_name())
                .join(self.canonical_version()),
            Task::Module { name } => packages_root.join("node_modules").join(name),
            Task::Local { dir } => packages_root.join(dir),
            Task::Sub(sub) => match &sub.dir {
                Some(dir) => dir.clone(),
                None => sub.task.dir(packages_root),
            },
        }
    }

    /// Version of the top-level package this task belongs to.
    pub fn root_version(&self) -> String {
        match self {
            Task::Sub(sub) => sub.task.root_version(),
            _ => self.canonical_version(),
        }
    }

    /// The enclosing task of a sub-project.
    pub fn parent(&self) -> Option<&Task> {
        match self {
            Task::Sub(sub) => Some(&sub.task),
            _ => None,
        }
    }

    /// Whether sources can be downloaded from a registry or repository.
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Task::Registry { .. } | Task::Repository { .. })
    }

    /// Variant name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Registry { .. } => "RegistryTask",
            Task::Repository { .. } => "RepositoryTask",
            Task::Module { .. } => "ModuleTask",
            Task::Url { .. } => "UrlTask",
            Task::Local { .. } => "LocalTask",
            Task::Sub(_) => "SubTask",
        }
    }

    /// Serialize to the task-database dictionary form.
    pub fn to_value(&self) -> serde_json::Value {
        // Every variant is a plain struct of strings, serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Parse the task-database dictionary form.
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_name() == other.canonical_name()
            && self.canonical_version() == other.canonical_version()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_name().hash(state);
        self.canonical_version().hash(state);
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{}",
            self.kind(),
            self.canonical_name(),
            self.canonical_version()
        )
    }
}

/// Last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Scheme, host and path of a URL; query and fragment are dropped.
struct UrlParts<'a> {
    scheme: &'a str,
    host: &'a str,
    path: &'a str,
}

impl<'a> UrlParts<'a> {
    fn parse(url: &'a str) -> Self {
        let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let path = path.split(['?', '#']).next().unwrap_or("");
        Self { scheme, host, path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_identity() {
        let task = Task::registry("@babel/core", "7.0.0");
        assert_eq!(task.canonical_name(), "@babel__core");
        assert_eq!(task.canonical_version(), "7.0.0");
        assert_eq!(
            task.dir(Path::new("/pkgs")),
            PathBuf::from("/pkgs/@babel__core/7.0.0")
        );
        assert_eq!(task.to_string(), "RegistryTask: @babel__core/7.0.0");
    }

    #[test]
    fn test_dir_is_stable() {
        let tasks = vec![
            Task::registry("left-pad", "1.3.0"),
            Task::repository("owner/repo", "abc123"),
            Task::url("https://example.com/a/b?x=1"),
            Task::local("sites/one"),
            Task::Module { name: "lodash".into() },
        ];
        let root = Path::new("/pkgs");
        for task in &tasks {
            assert_eq!(task.dir(root), task.clone().dir(root));
        }
    }

    #[test]
    fn test_url_identity() {
        let task = Task::url("https://example.com/a/b?x=1");
        assert_eq!(task.canonical_name(), "https:example.com");
        assert_eq!(task.canonical_version(), "a#b");
        assert_eq!(
            task.dir(Path::new("/pkgs")),
            PathBuf::from("/pkgs/https:example.com/a#b")
        );

        let bare = Task::url("https://example.com");
        assert_eq!(bare.canonical_version(), "root");
    }

    #[test]
    fn test_module_and_local_dirs() {
        let module = Task::Module { name: "lodash".into() };
        assert_eq!(
            module.dir(Path::new("/pkgs")),
            PathBuf::from("/pkgs/node_modules/lodash")
        );
        let local = Task::local("crawl/site");
        assert_eq!(local.canonical_version(), "0");
        assert_eq!(local.dir(Path::new("/pkgs")), PathBuf::from("/pkgs/crawl/site"));
    }

    #[test]
    fn test_subtask_version_truncation() {
        let parent = Task::repository("o/r", "c1");
        let long_name = "n".repeat(50);
        let sub = Task::Sub(SubTask::new(
            parent,
            format!("@scope/{}", long_name),
            "1.0.0-beta.12345#root",
            Some(PathBuf::from("/pkgs/o__r/c1/packages/x")),
        ));
        let version = sub.canonical_version();
        let parts: Vec<&str> = version.split(SUB_DELIMITER).collect();
        assert_eq!(parts[0], "c1");
        assert_eq!(parts[1].chars().count(), SUB_NAME_MAX);
        assert_eq!(parts[2], "a.12345#root");
        assert_eq!(sub.dir(Path::new("/pkgs")), PathBuf::from("/pkgs/o__r/c1/packages/x"));
        assert_eq!(sub.root_version(), "c1");
    }

    #[test]
    fn test_subtask_equality_matches_directory_identity() {
        let parent = Task::repository("o/r", "c1");
        let prefix = "x".repeat(40);
        let a = Task::Sub(SubTask::new(parent.clone(), format!("{prefix}-same-tail"), "1.0.0", None));
        let b = Task::Sub(SubTask::new(parent.clone(), format!("y{prefix}-same-tail"), "1.0.0", None));
        let c = Task::Sub(SubTask::new(parent, "other", "1.0.0", None));

        assert_eq!(a.canonical_version(), b.canonical_version());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Task> = vec![a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_dict_form() {
        let json = serde_json::json!([
            {"type": "npm", "name": "left-pad", "version": "1.3.0"},
            {"type": "git", "repo": "o/r", "commitId": "abc"},
            {"type": "module", "name": "lodash"},
            {"type": "url", "url": "https://example.com/x"},
            {"type": "local", "dir": "site"},
            {"type": "subtask", "task": {"type": "git", "repo": "o/r", "commitId": "abc"},
             "subName": "pkg", "subVersion": "1.0.0"}
        ]);
        let tasks: Vec<Task> = serde_json::from_value(json).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(matches!(tasks[1], Task::Repository { ref commit, .. } if commit == "abc"));

        let value = tasks[5].to_value();
        assert_eq!(value["type"], "subtask");
        assert_eq!(value["task"]["commitId"], "abc");
        assert_eq!(Task::from_value(value).unwrap(), tasks[5]);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let value = serde_json::json!({"type": "svn", "url": "x"});
        assert!(Task::from_value(value).is_err());
    }
}
