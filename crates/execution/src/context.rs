//! Per-run context shared by every task of a batch.

use benchman_core::{Config, Task, DEFAULT_TASK_NAME};
use benchman_storage::{Layout, MarkerDir};
use std::path::PathBuf;
use std::sync::Arc;

/// Immutable settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Runner configuration
    pub config: Arc<Config>,
    /// Storage layout derived from the configuration
    pub layout: Layout,
    /// Run label, the first path component below the results root
    pub label: String,
    /// Name of the run (`$TASK_NAME`)
    pub task_name: String,
    /// Directory of reference artifacts (`$DYNAMIC_DIR`)
    pub dynamic_dir: Option<PathBuf>,
    /// Ignore existing finish markers
    pub rerun: bool,
    /// Tasks never handed to tools
    pub deny: Vec<Task>,
    /// When set, only these tasks are handed to tools
    pub allow: Option<Vec<Task>>,
}

impl RunContext {
    /// Context for run `label`.
    pub fn new(config: Arc<Config>, label: impl Into<String>) -> Self {
        Self {
            layout: Layout::from_config(&config),
            config,
            label: label.into(),
            task_name: DEFAULT_TASK_NAME.to_string(),
            dynamic_dir: None,
            rerun: false,
            deny: Vec::new(),
            allow: None,
        }
    }

    /// Builder: set the run name.
    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    /// Builder: set the reference artifact directory.
    pub fn with_dynamic_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dynamic_dir = dir;
        self
    }

    /// Builder: ignore finish markers.
    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    /// Builder: set the deny list.
    pub fn with_deny(mut self, deny: Vec<Task>) -> Self {
        self.deny = deny;
        self
    }

    /// Builder: set the allow list.
    pub fn with_allow(mut self, allow: Option<Vec<Task>>) -> Self {
        self.allow = allow;
        self
    }

    /// Whether the allow/deny lists exclude `task`.
    ///
    /// A sub-project is matched by its own identity or its parent's.
    pub fn is_excluded(&self, task: &Task) -> bool {
        let listed = |list: &[Task]| {
            list.contains(task) || task.parent().is_some_and(|parent| list.contains(parent))
        };
        if listed(&self.deny) {
            return true;
        }
        match &self.allow {
            Some(allow) if !allow.is_empty() => !listed(allow),
            _ => false,
        }
    }

    /// Whether the lists exclude a top-level `task` as a whole.
    ///
    /// An allow list naming only some of the task's sub-projects keeps the
    /// task; the other sub-projects are excluded one by one.
    pub fn excludes_task(&self, task: &Task) -> bool {
        if !self.is_excluded(task) {
            return false;
        }
        match &self.allow {
            Some(allow) if !self.deny.contains(task) => {
                !allow.iter().any(|listed| listed.parent() == Some(task))
            }
            _ => true,
        }
    }

    /// Results directory of `task`.
    pub fn result_dir(&self, task: &Task) -> PathBuf {
        self.layout.result_dir(&self.label, task)
    }

    /// Scratch directory of `task`.
    pub fn scratch_dir(&self, task: &Task) -> PathBuf {
        self.layout.scratch_dir(&self.label, task)
    }

    /// Finish markers of `task`.
    pub fn markers(&self, task: &Task) -> MarkerDir {
        MarkerDir::new(self.result_dir(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        RunContext::new(Arc::new(Config::new("/work")), "run")
    }

    #[test]
    fn test_deny_list() {
        let denied = Task::registry("bad", "1.0.0");
        let ctx = context().with_deny(vec![denied.clone()]);
        assert!(ctx.is_excluded(&denied));
        assert!(!ctx.is_excluded(&Task::registry("good", "1.0.0")));
    }

    #[test]
    fn test_allow_list() {
        let allowed = Task::registry("only", "1.0.0");
        let ctx = context().with_allow(Some(vec![allowed.clone()]));
        assert!(!ctx.is_excluded(&allowed));
        assert!(ctx.is_excluded(&Task::registry("other", "1.0.0")));

        let empty = context().with_allow(Some(Vec::new()));
        assert!(!empty.is_excluded(&allowed));
    }

    #[test]
    fn test_lists_match_parent_of_sub_project() {
        let parent = Task::repository("o/mono", "abc");
        let sub = Task::Sub(benchman_core::SubTask::new(parent.clone(), "pkg", "1.0.0", None));

        assert!(context().with_deny(vec![parent.clone()]).is_excluded(&sub));
        assert!(!context().with_allow(Some(vec![parent])).is_excluded(&sub));
        assert!(context()
            .with_allow(Some(vec![Task::registry("other", "1")]))
            .is_excluded(&sub));
    }

    #[test]
    fn test_allow_listed_sub_project_keeps_parent() {
        let parent = Task::local("site");
        let one = Task::Sub(benchman_core::SubTask::new(parent.clone(), "one", "", None));
        let two = Task::Sub(benchman_core::SubTask::new(parent.clone(), "two", "", None));
        let ctx = context().with_allow(Some(vec![one.clone()]));

        assert!(!ctx.excludes_task(&parent));
        assert!(!ctx.is_excluded(&one));
        assert!(ctx.is_excluded(&two));
        assert!(ctx.excludes_task(&Task::local("other")));

        let denied = context()
            .with_allow(Some(vec![one]))
            .with_deny(vec![parent.clone()]);
        assert!(denied.excludes_task(&parent));
    }

    #[test]
    fn test_dirs() {
        let ctx = context();
        let task = Task::registry("left-pad", "1.3.0");
        assert_eq!(ctx.result_dir(&task), PathBuf::from("/work/results/run/left-pad/1.3.0"));
        assert_eq!(ctx.scratch_dir(&task), PathBuf::from("/work/tmp/run/left-pad/1.3.0"));
    }
}
