//! The pipeline engine - runs a descriptor's phases for one task.
//!
//! ```text
//! before ──▶ sub_tasks (once per discovered sub-project) ──▶ after
//! ```
//!
//! Step failures are logged and counted but never abort a phase. Completed
//! units leave finish markers behind, so a second run only does the work the
//! first one did not finish.

use crate::context::RunContext;
use crate::discovery;
use crate::operations::{Operation, StepRunner};
use crate::source::SourcePreparer;
use crate::vars::Vars;
use benchman_core::{Config, PipelineDescriptor, Result, Step, Task};
use benchman_storage::{FinishMarker, MarkerDir, ResultEntry};
use benchman_tools::{CommandExecutor, DockerSandbox, ScopedWorkspace};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// How a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every step succeeded; the task is marked finished
    Completed,
    /// Some steps failed; they run again next time
    Failed {
        /// Number of failed steps, sub-projects included
        failed_steps: usize,
    },
    /// Excluded by the allow/deny lists
    Excluded,
    /// Finished by an earlier run
    AlreadyFinished,
}

/// Progress of one task run.
#[derive(Debug, Default)]
struct TaskRun {
    /// `None` until preparation ran, then whether the sources are usable
    source_ready: Option<bool>,
    failures: usize,
}

/// Runs a pipeline descriptor for single tasks.
pub struct PipelineEngine {
    descriptor: Arc<PipelineDescriptor>,
    steps: StepRunner,
    preparer: Arc<SourcePreparer>,
}

impl PipelineEngine {
    /// Engine running `descriptor` through `steps`.
    pub fn new(
        descriptor: Arc<PipelineDescriptor>,
        steps: StepRunner,
        preparer: Arc<SourcePreparer>,
    ) -> Self {
        if !descriptor.db_builders.is_empty() {
            warn!(
                builders = descriptor.db_builders.len(),
                "db_builders are not supported, ignoring them"
            );
        }
        Self {
            descriptor,
            steps,
            preparer,
        }
    }

    /// Engine with the production sandbox and source preparer.
    pub fn from_config(
        descriptor: Arc<PipelineDescriptor>,
        config: Arc<Config>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let sandbox = Arc::new(DockerSandbox::from_config(&config, executor.clone()));
        let preparer = Arc::new(SourcePreparer::from_config(config, executor.clone(), sandbox.clone()));
        let steps = StepRunner::new(executor, sandbox, preparer.clone());
        Self::new(descriptor, steps, preparer)
    }

    /// The descriptor being run.
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    /// Run every phase for `task`.
    ///
    /// Only infrastructure errors (scratch or results dirs that cannot be
    /// created) are returned; step failures are reported in the outcome.
    pub async fn run_task(&self, ctx: &RunContext, task: &Task) -> Result<TaskOutcome> {
        let markers = ctx.markers(task);
        if ctx.excludes_task(task) {
            info!(task = %task, "excluded by allow/deny list, skipping");
            markers.mark(&FinishMarker::Skip).await?;
            return Ok(TaskOutcome::Excluded);
        }
        if !ctx.rerun && markers.contains(&FinishMarker::Finished).await {
            debug!(task = %task, "already finished");
            return Ok(TaskOutcome::AlreadyFinished);
        }

        info!(task = %task, label = %ctx.label, "running pipeline");
        let _workspace = ScopedWorkspace::acquire(ctx.scratch_dir(task)).await?;
        fs::create_dir_all(markers.dir()).await?;

        let descriptor = &self.descriptor;
        let vars = Vars::for_task(ctx, task);
        let mut run = TaskRun::default();

        for (index, step) in descriptor.before.iter().enumerate() {
            self.run_step(ctx, task, &vars, &markers, step, index, &mut run).await;
        }

        if !descriptor.sub_tasks.is_empty() {
            self.run_sub_phase(ctx, task, &mut run).await;
        }

        let offset = descriptor.before.len();
        for (index, step) in descriptor.after.iter().enumerate() {
            self.run_step(ctx, task, &vars, &markers, step, offset + index, &mut run)
                .await;
        }

        if run.failures > 0 {
            warn!(task = %task, failed_steps = run.failures, "pipeline finished with failures");
            return Ok(TaskOutcome::Failed {
                failed_steps: run.failures,
            });
        }
        markers.mark(&FinishMarker::Finished).await?;
        info!(task = %task, "pipeline finished");
        Ok(TaskOutcome::Completed)
    }

    /// Result entries of the run that match the descriptor's version filter.
    pub async fn matching_results(&self, ctx: &RunContext) -> Result<Vec<ResultEntry>> {
        let pattern = self.descriptor.settings.version_regex()?;
        ctx.layout.result_entries(&ctx.label, pattern.as_ref()).await
    }

    async fn run_sub_phase(&self, ctx: &RunContext, task: &Task, run: &mut TaskRun) {
        let steps = &self.descriptor.sub_tasks;
        if steps.iter().any(|s| Operation::requires_source(s).unwrap_or(false))
            && !self.ensure_source(ctx, task, run).await
        {
            error!(task = %task, "sources unavailable, skipping sub-projects");
            run.failures += 1;
            return;
        }

        let root = task.dir(ctx.layout.packages_root());
        let subs = match discovery::discover(task, &root, ctx.config.max_sub_packages).await {
            Ok(subs) => subs,
            Err(e) => {
                error!(task = %task, error = %e, "sub-project discovery failed");
                run.failures += 1;
                return;
            }
        };
        info!(task = %task, count = subs.len(), "discovered sub-projects");

        for found in subs {
            let sub = &found.task;
            let markers = ctx.markers(sub);
            if !ctx.rerun && markers.is_settled().await {
                debug!(task = %sub, "sub-project already settled");
                continue;
            }
            if ctx.is_excluded(sub) {
                info!(task = %sub, "excluded by allow/deny list, skipping");
                if let Err(e) = markers.mark(&FinishMarker::Skip).await {
                    error!(task = %sub, error = %e, "failed to write skip marker");
                }
                continue;
            }

            let _workspace = match ScopedWorkspace::acquire(ctx.scratch_dir(sub)).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    error!(task = %sub, error = %e, "failed to create scratch dir");
                    run.failures += 1;
                    continue;
                }
            };
            let vars = Vars::for_task(ctx, sub);
            let failures_before = run.failures;
            for (index, step) in steps.iter().enumerate() {
                self.run_step(ctx, sub, &vars, &markers, step, index, run).await;
            }
            if run.failures == failures_before {
                if let Err(e) = markers.mark(&FinishMarker::Finished).await {
                    error!(task = %sub, error = %e, "failed to write finish marker");
                }
            }
        }
    }

    /// Fetch and install the sources once per task run.
    ///
    /// Returns whether the sources are usable. A failed preparation is not
    /// retried within the same run.
    async fn ensure_source(&self, ctx: &RunContext, task: &Task, run: &mut TaskRun) -> bool {
        if !ctx.config.install_dependencies {
            return true;
        }
        if let Some(ready) = run.source_ready {
            return ready;
        }
        let ready = match self.preparer.prepare(ctx, task, false).await {
            Ok(_) => true,
            Err(e) => {
                error!(task = %task, error = %e, "source preparation failed");
                false
            }
        };
        run.source_ready = Some(ready);
        ready
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        ctx: &RunContext,
        task: &Task,
        vars: &Vars,
        markers: &MarkerDir,
        step: &Step,
        index: usize,
        run: &mut TaskRun,
    ) {
        let step = vars.apply_step(step);
        let marker = match Operation::marker(&step, index) {
            Ok(marker) => marker,
            Err(e) => {
                error!(task = %task, step = %step.name, error = %e, "invalid step");
                run.failures += 1;
                return;
            }
        };
        if let Some(marker) = &marker {
            if !ctx.rerun && markers.contains(marker).await {
                debug!(task = %task, step = %step.name, index, "step already finished");
                return;
            }
        }
        // `prepare` steps fetch on their own, honouring their `rerun` flag
        let prepares = matches!(Operation::lookup(&step.name), Ok(Operation::Prepare));
        if !prepares
            && Operation::requires_source(&step).unwrap_or(false)
            && !self.ensure_source(ctx, task, run).await
        {
            warn!(task = %task, step = %step.name, index, "sources unavailable, skipping step");
            run.failures += 1;
            return;
        }

        let result = self.steps.run(ctx, task, &step).await;
        if prepares {
            run.source_ready = Some(result.is_ok());
        }
        match result {
            Ok(false) => {
                debug!(task = %task, step = %step.name, index, "step gated off, no marker written");
            }
            Ok(true) => {
                if let Some(marker) = &marker {
                    if let Err(e) = markers.mark(marker).await {
                        error!(task = %task, step = %step.name, error = %e, "failed to write finish marker");
                    }
                }
            }
            Err(e) => {
                error!(task = %task, step = %step.name, index, error = %e, "step failed");
                run.failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::{CountingFetcher, CountingInstaller, Scripted};
    use benchman_tools::CommandRunner;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ctx: RunContext,
        fetcher: Arc<CountingFetcher>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(Arc::new(Config::new(dir.path())), "run");
        let fetcher = Arc::new(CountingFetcher {
            dir: dir.path().join("src"),
            ..Default::default()
        });
        Fixture {
            _dir: dir,
            ctx,
            fetcher,
        }
    }

    fn engine(fx: &Fixture, descriptor: &str, executor: Arc<dyn CommandExecutor>) -> PipelineEngine {
        let descriptor = PipelineDescriptor::parse(descriptor, "test").unwrap();
        let sandbox = Arc::new(DockerSandbox::new("docker", "analyzer", executor.clone()).with_rootless(true));
        let preparer = Arc::new(SourcePreparer::new(
            fx.fetcher.clone(),
            Arc::new(CountingInstaller::default()),
        ));
        let steps = StepRunner::new(executor, sandbox, preparer.clone());
        PipelineEngine::new(Arc::new(descriptor), steps, preparer)
    }

    #[tokio::test]
    async fn test_echo_step_logs_output() {
        let fx = fixture();
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "exec_command", "command": "echo hi"}]}"#,
            Arc::new(CommandRunner::new()),
        );
        let task = Task::registry("left-pad", "1.3.0");

        let outcome = engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        let result = fx.ctx.result_dir(&task);
        let log = std::fs::read_to_string(result.join("echohi.log")).unwrap();
        assert!(log.starts_with("echo hi\n\n\n\nhi\n"));
        assert!(result.join(".finished").exists());
        assert!(!fx.ctx.scratch_dir(&task).exists());
    }

    #[tokio::test]
    async fn test_second_run_fetches_nothing() {
        let fx = fixture();
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "run_tool", "args": "--x"}]}"#,
            executor.clone(),
        );
        let task = Task::registry("left-pad", "1.3.0");

        assert_eq!(engine.run_task(&fx.ctx, &task).await.unwrap(), TaskOutcome::Completed);
        let calls = executor.commands().len();
        assert_eq!(engine.run_task(&fx.ctx, &task).await.unwrap(), TaskOutcome::AlreadyFinished);

        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.commands().len(), calls);
    }

    #[tokio::test]
    async fn test_step_markers_resume_failed_runs() {
        let fx = fixture();
        let executor = Arc::new(Scripted {
            fail_when: Some("second"),
            ..Default::default()
        });
        let engine = engine(
            &fx,
            r#"{"before": [
                {"name": "exec_command", "command": "first", "require_source": true},
                {"name": "exec_command", "command": "second", "require_source": true, "accept_failure": false}
            ]}"#,
            executor.clone(),
        );
        let task = Task::registry("a", "1.0.0");

        let outcome = engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { failed_steps: 1 });
        let result = fx.ctx.result_dir(&task);
        assert!(result.join(".finished_0").exists());
        assert!(!result.join(".finished_1").exists());
        assert!(!result.join(".finished").exists());

        engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(executor.commands(), vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn test_denied_task_is_skipped() {
        let fx = fixture();
        let task = Task::registry("bad", "6.6.6");
        let ctx = fx.ctx.clone().with_deny(vec![task.clone()]);
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "run_tool"}], "after": [{"name": "exec_command", "command": "x"}]}"#,
            executor.clone(),
        );

        assert_eq!(engine.run_task(&ctx, &task).await.unwrap(), TaskOutcome::Excluded);
        let skip = ctx.result_dir(&task).join(".skip");
        assert_eq!(std::fs::read_to_string(skip).unwrap(), "");
        assert!(executor.commands().is_empty());
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_does_not_abort() {
        let fx = fixture();
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "teleport"}, {"name": "exec_command", "command": "after"}]}"#,
            executor.clone(),
        );
        let outcome = engine.run_task(&fx.ctx, &Task::registry("a", "1")).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { failed_steps: 1 });
        assert_eq!(executor.commands(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_sub_phase_runs_per_sub_project() {
        let fx = fixture();
        let task = Task::local("site");
        let root = task.dir(fx.ctx.layout.packages_root());
        for child in ["one", "two", "three"] {
            std::fs::create_dir_all(root.join(child)).unwrap();
        }
        let denied = Task::Sub(benchman_core::SubTask::new(task.clone(), "two", "", None));
        let ctx = fx.ctx.clone().with_deny(vec![denied.clone()]);
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"sub_tasks": [{"name": "exec_command", "command": "analyze $TARGET"}],
                "after": [{"name": "exec_command", "command": "summarize $RESULTS_DIR"}]}"#,
            executor.clone(),
        );

        assert_eq!(engine.run_task(&ctx, &task).await.unwrap(), TaskOutcome::Completed);
        let commands = executor.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].ends_with("site/one"));
        assert!(commands[1].ends_with("site/three"));
        assert!(commands[2].starts_with("summarize "));
        assert!(ctx.result_dir(&denied).join(".skip").exists());
        assert!(ctx.markers(&denied).is_settled().await);

        // settled sub-projects are not revisited
        let again = ctx.clone().with_rerun(false);
        std::fs::remove_file(ctx.result_dir(&task).join(".finished")).unwrap();
        engine.run_task(&again, &task).await.unwrap();
        assert_eq!(executor.commands().len(), 4);
    }

    #[tokio::test]
    async fn test_allow_listed_sub_project_runs() {
        let fx = fixture();
        let task = Task::local("site");
        let root = task.dir(fx.ctx.layout.packages_root());
        for child in ["one", "two"] {
            std::fs::create_dir_all(root.join(child)).unwrap();
        }
        let one = Task::Sub(benchman_core::SubTask::new(task.clone(), "one", "", None));
        let two = Task::Sub(benchman_core::SubTask::new(task.clone(), "two", "", None));
        let ctx = fx.ctx.clone().with_allow(Some(vec![one.clone()]));
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"sub_tasks": [{"name": "exec_command", "command": "analyze $TARGET"}]}"#,
            executor.clone(),
        );

        assert_eq!(engine.run_task(&ctx, &task).await.unwrap(), TaskOutcome::Completed);
        let commands = executor.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].ends_with("site/one"));
        assert!(ctx.result_dir(&one).join(".finished").exists());
        assert!(ctx.result_dir(&two).join(".skip").exists());
    }

    #[tokio::test]
    async fn test_failed_preparation_fails_the_task() {
        let mut fx = fixture();
        fx.fetcher = Arc::new(CountingFetcher {
            unreachable: true,
            ..Default::default()
        });
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "run_tool", "args": "--x"}, {"name": "exec_command", "command": "tidy"}]}"#,
            executor.clone(),
        );
        let task = Task::registry("left-pad", "1.3.0");

        let outcome = engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { failed_steps: 1 });
        assert_eq!(executor.commands(), vec!["tidy"]);
        let result = fx.ctx.result_dir(&task);
        assert!(!result.join(".finished_0").exists());
        assert!(!result.join(".finished").exists());

        // the next run tries again
        let outcome = engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { failed_steps: 1 });
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prepare_step_fetches_once_per_run() {
        let fx = fixture();
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "prepare", "rerun": true}]}"#,
            Arc::new(Scripted::default()),
        );
        let task = Task::registry("left-pad", "1.3.0");

        assert_eq!(engine.run_task(&fx.ctx, &task).await.unwrap(), TaskOutcome::Completed);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);

        let rerun = fx.ctx.clone().with_rerun(true);
        assert_eq!(engine.run_task(&rerun, &task).await.unwrap(), TaskOutcome::Completed);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gated_tool_step_resumes() {
        let fx = fixture();
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [
                {"name": "conditional_step", "condition": "false", "execute": {"name": "exec_command", "command": "never", "require_source": true}},
                {"name": "conditional_step", "condition": "true", "execute": {"name": "jelly", "args": "--x"}}
            ]}"#,
            executor.clone(),
        );
        let task = Task::registry("a", "1.0.0");

        engine.run_task(&fx.ctx, &task).await.unwrap();
        let result = fx.ctx.result_dir(&task);
        assert!(!result.join(".finished_0").exists());
        assert!(result.join(".finished_1").exists());
        assert_eq!(executor.commands().len(), 1);

        std::fs::remove_file(result.join(".finished")).unwrap();
        engine.run_task(&fx.ctx, &task).await.unwrap();
        assert_eq!(executor.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_ignores_markers() {
        let fx = fixture();
        let executor = Arc::new(Scripted::default());
        let engine = engine(
            &fx,
            r#"{"before": [{"name": "exec_command", "command": "x", "finish_file": ".x_done"}]}"#,
            executor.clone(),
        );
        let task = Task::registry("a", "1");
        engine.run_task(&fx.ctx, &task).await.unwrap();
        assert!(fx.ctx.result_dir(&task).join(".x_done").exists());

        let rerun = fx.ctx.clone().with_rerun(true);
        engine.run_task(&rerun, &task).await.unwrap();
        assert_eq!(executor.commands().len(), 2);
    }
}
