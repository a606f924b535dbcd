//! Operation registry and step dispatch.
//!
//! Every pipeline step names one [`Operation`]. The [`StepRunner`] executes
//! an already-interpolated step for one task; the engine decides when, and
//! records finish markers for the operations that produce them.

use crate::condition;
use crate::context::RunContext;
use crate::source::SourcePreparer;
use crate::vars::Vars;
use benchman_core::{parse_memory_mb, BenchError, Result, Step, Task};
use benchman_storage::FinishMarker;
use benchman_tools::{
    CommandExecutor, CommandOutcome, CommandSpec, DockerSandbox, SandboxLimits, SandboxRun,
    ScopedWorkspace, PACKAGE_MOUNT,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// Reference call graph looked up below the dynamic directory.
pub const DYNAMIC_CALLGRAPH: &str = "dynamic_callgraph.json";

const COMPARE_TIMEOUT: Duration = Duration::from_secs(600);
/// Grace period on top of the analysis timeout handed to the tool itself.
const TOOL_GRACE: Duration = Duration::from_secs(100);

/// A registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Fetch and install the task's sources
    Prepare,
    /// Run the analysis tool, in the sandbox when configured
    RunTool,
    /// Run the analysis tool in the sandbox
    RunToolSandboxed,
    /// Build a security-scanner database and analyze it
    Codeql,
    /// Run a shell command
    ExecCommand,
    /// Remove a path below the result dir
    Remove,
    /// Hard-link one file to another
    HardLink,
    /// Link a reference artifact into the result dir
    LinkExternalFile,
    /// Compare two artifacts of the result dir
    CompareArtifacts,
    /// Compare an artifact to the reference artifact of the task
    CompareToDynamic,
    /// Run a nested step when a condition holds
    Conditional,
}

impl Operation {
    /// Look up an operation by step name.
    pub fn lookup(name: &str) -> Result<Self> {
        Ok(match name {
            "prepare" => Operation::Prepare,
            "run_tool" | "jelly" => Operation::RunTool,
            "run_tool_sandboxed" => Operation::RunToolSandboxed,
            "codeql" => Operation::Codeql,
            "exec_command" => Operation::ExecCommand,
            "rm" => Operation::Remove,
            "hard_link" => Operation::HardLink,
            "link_external_file" | "link_dyn_callgraph" => Operation::LinkExternalFile,
            "compare_artifacts" | "compare_callgraphs" => Operation::CompareArtifacts,
            "compare_to_dynamic" => Operation::CompareToDynamic,
            "conditional_step" => Operation::Conditional,
            other => return Err(BenchError::UnknownOperation(other.to_string())),
        })
    }

    /// Whether `step` needs fetched and installed sources.
    pub fn requires_source(step: &Step) -> Result<bool> {
        match Self::lookup(&step.name)? {
            Operation::Prepare | Operation::RunTool | Operation::RunToolSandboxed => Ok(true),
            Operation::ExecCommand => step.bool_param(&["require_source"], false),
            Operation::Conditional => Self::requires_source(&step.step_param(&["execute"])?),
            _ => Ok(false),
        }
    }

    /// Finish marker recorded after `step` succeeds at position `index`.
    pub fn marker(step: &Step, index: usize) -> Result<Option<FinishMarker>> {
        Ok(match Self::lookup(&step.name)? {
            Operation::ExecCommand => {
                if let Some(name) = step.str_param(&["finish_file"])? {
                    Some(FinishMarker::Named(name))
                } else if step.bool_param(&["require_source"], false)? {
                    Some(FinishMarker::Step(index))
                } else {
                    None
                }
            }
            Operation::Prepare
            | Operation::RunTool
            | Operation::RunToolSandboxed
            | Operation::Codeql
            | Operation::CompareArtifacts
            | Operation::CompareToDynamic => Some(FinishMarker::Step(index)),
            Operation::Conditional => Self::marker(&step.step_param(&["execute"])?, index)?,
            _ => None,
        })
    }
}

/// Executes single steps.
pub struct StepRunner {
    executor: Arc<dyn CommandExecutor>,
    sandbox: Arc<DockerSandbox>,
    preparer: Arc<SourcePreparer>,
}

impl StepRunner {
    /// Runner dispatching commands through `executor`.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        sandbox: Arc<DockerSandbox>,
        preparer: Arc<SourcePreparer>,
    ) -> Self {
        Self {
            executor,
            sandbox,
            preparer,
        }
    }

    /// Run `step`, whose parameters are already interpolated, for `task`.
    ///
    /// Returns `false` when a condition gated the step off.
    pub async fn run(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<bool> {
        let mut step = step.clone();
        loop {
            let operation = Operation::lookup(&step.name)?;
            tracing::debug!(task = %task, step = %step.name, "running step");
            match operation {
                Operation::Prepare => self.prepare(ctx, task, &step).await?,
                Operation::RunTool => self.run_tool(ctx, task, &step, false).await?,
                Operation::RunToolSandboxed => self.run_tool(ctx, task, &step, true).await?,
                Operation::Codeql => self.codeql(ctx, task, &step).await?,
                Operation::ExecCommand => self.exec_command(ctx, task, &step).await?,
                Operation::Remove => remove(ctx, task, &step).await?,
                Operation::HardLink => hard_link(ctx, task, &step).await?,
                Operation::LinkExternalFile => link_external_file(ctx, task, &step).await?,
                Operation::CompareArtifacts => self.compare_artifacts(ctx, task, &step).await?,
                Operation::CompareToDynamic => self.compare_to_dynamic(ctx, task, &step).await?,
                Operation::Conditional => {
                    let source = step.required_str(&["condition"])?;
                    if !condition::evaluate(&source)? {
                        tracing::info!(task = %task, condition = %source, "condition is false, skipping step");
                        return Ok(false);
                    }
                    let nested = step.step_param(&["execute"])?;
                    step = Vars::for_task(ctx, task).apply_step(&nested);
                    continue;
                }
            }
            return Ok(true);
        }
    }

    async fn prepare(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
        let force = step.bool_param(&["rerun"], false)?;
        self.preparer.prepare(ctx, task, force).await?;
        Ok(())
    }

    async fn run_tool(&self, ctx: &RunContext, task: &Task, step: &Step, sandboxed: bool) -> Result<()> {
        let config = &ctx.config;
        let args = step.str_param(&["args", "jelly_args"])?.unwrap_or_default();
        let log_file = step.str_param(&["log_file"])?.unwrap_or_else(|| "stdout.log".to_string());
        let timeout = step.u64_param(&["timeout"])?.unwrap_or(config.timeout_secs);
        let memory = step
            .str_param(&["memory"])?
            .unwrap_or_else(|| config.memory_per_process.clone());
        let cpus = match step.u64_param(&["cpus"])? {
            Some(cpus) => u32::try_from(cpus)
                .map_err(|_| BenchError::invalid_param(&step.name, "cpus", "out of range"))?,
            None => config.cpus_per_process,
        };
        let target_last = step.bool_param(&["target_last"], args.contains("--npm-test"))?;
        let sandboxed = sandboxed || step.bool_param(&["sandbox"], config.running_in_docker)?;
        let old_dir = step
            .str_param(&["old_dir"])?
            .map(|dir| Path::new(&dir).join(task.canonical_name()).join(task.canonical_version()));

        let output = ctx.result_dir(task);
        fs::create_dir_all(&output).await?;
        let target = task.dir(ctx.layout.packages_root());
        let log = output.join(&log_file);
        let limit = Duration::from_secs(timeout) + TOOL_GRACE;

        let (command, outcome) = if sandboxed {
            let inner = (timeout as f64 * 0.98) as u64;
            let mut docker_args = format!("-v '{}':/workspace -w /workspace", output.display());
            if let Some(old) = &old_dir {
                docker_args.push_str(&format!(" -v '{}':/old", old.display()));
            }
            let tool_args = if target_last {
                format!("-i {inner} {args} {PACKAGE_MOUNT}")
            } else {
                format!("{PACKAGE_MOUNT} -i {inner} {args}")
            };
            let run = SandboxRun {
                label: ctx.label.clone(),
                task: task.clone(),
                package_dir: target,
                docker_args,
                tool_args,
                limits: SandboxLimits { cpus, memory },
                timeout: Some(limit),
                log_path: Some(log),
            };
            let command = self.sandbox.command_line(&run).await;
            (command, self.sandbox.run(&run).await?)
        } else {
            let tool = step
                .str_param(&["tool_path", "jelly_path"])?
                .map(PathBuf::from)
                .unwrap_or_else(|| config.analyzer_path.clone());
            let args = match &old_dir {
                Some(old) => args.replace("/old", &old.display().to_string()),
                None => args,
            };
            let command = if target_last {
                format!("node '{}' -i {timeout} {args} '{}'", tool.display(), target.display())
            } else {
                format!("node '{}' '{}' -i {timeout} {args}", tool.display(), target.display())
            };
            let spec = CommandSpec::new(command.trim_end())
                .with_env("NODE_OPTIONS", node_options(&memory))
                .with_cwd(&output)
                .with_timeout(limit);
            let outcome = self.executor.run_and_log(&spec, &log).await?;
            (spec.command, outcome)
        };
        check_exit(task, step, command, &outcome)
    }

    async fn codeql(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
        let config = &ctx.config;
        let rules = step.required_str(&["rules"])?;
        let label = step.str_param(&["output_label"])?.unwrap_or_else(|| "codeql".to_string());
        let timeout = Duration::from_secs(step.u64_param(&["timeout"])?.unwrap_or(config.timeout_secs));
        let source_root = step
            .str_param(&["source_root"])?
            .map(PathBuf::from)
            .unwrap_or_else(|| task.dir(ctx.layout.packages_root()));

        let output = ctx.result_dir(task);
        fs::create_dir_all(&output).await?;
        if !fs::try_exists(&source_root).await? {
            let message = format!("source root {} does not exist", source_root.display());
            tracing::error!(task = %task, "{message}");
            fs::write(output.join(format!("{label}-analyzing.log")), &message).await?;
            return Err(BenchError::ArtifactMissing(source_root.display().to_string()));
        }

        let unique = chrono::Local::now().format("%Y%m%d%H%M%S%f");
        let workspace = ScopedWorkspace::acquire(ctx.scratch_dir(task).join(format!("{label}-{unique}"))).await?;
        let db = workspace.path().join("db");
        let binary = config.codeql_home.join("codeql").join("codeql");
        let resources = format!("--ram={} --threads={}", config.memory_mb(), config.cpus_per_process);

        let create = CommandSpec::new(format!(
            "'{}' database create --language=javascript '{}' --source-root='{}' {resources}",
            binary.display(),
            db.display(),
            source_root.display()
        ))
        .with_env("LGTM_INCLUDE_DIRS", source_root.display().to_string())
        .with_cwd(&output)
        .with_timeout(timeout);
        let outcome = self
            .executor
            .run_and_log(&create, &output.join(format!("{label}-making-db.log")))
            .await?;
        if !outcome.success() {
            return Err(BenchError::ToolInvocation {
                command: create.command,
                exit_code: outcome.exit_code,
            });
        }

        let analyze = CommandSpec::new(format!(
            "'{}' database analyze '{}' {rules} --format=csv --output='{}' {resources}",
            binary.display(),
            db.display(),
            output.join(format!("{label}-results.csv")).display()
        ))
        .with_cwd(&output)
        .with_timeout(timeout);
        let outcome = self
            .executor
            .run_and_log(&analyze, &output.join(format!("{label}-analyzing.log")))
            .await?;
        if !outcome.success() {
            return Err(BenchError::ToolInvocation {
                command: analyze.command,
                exit_code: outcome.exit_code,
            });
        }
        Ok(())
    }

    async fn exec_command(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
        let command = step.required_str(&["command"])?;
        let output = ctx.result_dir(task);
        fs::create_dir_all(&output).await?;

        let log_file = step
            .str_param(&["log_file"])?
            .unwrap_or_else(|| default_log_name(&command));
        let cwd = step
            .str_param(&["cwd"])?
            .map(|cwd| output.join(cwd))
            .unwrap_or_else(|| output.clone());

        let mut spec = CommandSpec::new(&command).with_cwd(cwd);
        spec.env = step.map_param(&["env"])?;
        if let Some(timeout) = step.u64_param(&["timeout"])? {
            spec.timeout = Some(Duration::from_secs(timeout));
        }
        let outcome = self.executor.run_and_log(&spec, &output.join(log_file)).await?;
        check_exit(task, step, command, &outcome)
    }

    async fn compare_artifacts(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
        let output = ctx.result_dir(task);
        let first = output.join(step.required_str(&["cg1"])?);
        let second = output.join(step.required_str(&["cg2"])?);
        let log_file = step.str_param(&["log_file"])?.unwrap_or_else(|| "compare.log".to_string());
        let tool = step
            .str_param(&["tool_path"])?
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.config.analyzer_path.clone());

        for artifact in [&first, &second] {
            if !fs::try_exists(artifact).await? {
                return Err(BenchError::ArtifactMissing(artifact.display().to_string()));
            }
        }

        let spec = CommandSpec::new(format!(
            "node '{}' --compare-callgraphs --reachability '{}' '{}'",
            tool.display(),
            first.display(),
            second.display()
        ))
        .with_cwd(&output)
        .with_timeout(COMPARE_TIMEOUT)
        .silent();
        let outcome = self.executor.run(&spec).await?;
        let body = if outcome.success() { outcome.tail(8) } else { outcome.output.clone() };
        fs::write(output.join(log_file), format!("{}\n\n{body}", spec.command)).await?;
        check_exit(task, step, spec.command, &outcome)
    }

    async fn compare_to_dynamic(&self, ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
        let config = &ctx.config;
        let output = ctx.result_dir(task);
        let compare_with = step
            .str_param(&["compare_with"])?
            .unwrap_or_else(|| "callgraph.json".to_string());
        let output_file = step
            .str_param(&["output_file"])?
            .unwrap_or_else(|| "comparison.txt".to_string());
        let log_file = step
            .str_param(&["log_file"])?
            .unwrap_or_else(|| "comparison.log".to_string());
        fs::create_dir_all(&output).await?;

        let dynamic = match &ctx.dynamic_dir {
            Some(dir) => reference_artifact(dir, task, DYNAMIC_CALLGRAPH).await,
            None => None,
        };
        let predicted = output.join(&compare_with);
        let Some(dynamic) = dynamic.filter(|_| predicted.exists()) else {
            tracing::warn!(task = %task, "skipping comparison, a call graph is missing");
            fs::write(
                output.join(&log_file),
                format!("Skipping {task}: dynamic or static call graph missing\n"),
            )
            .await?;
            return Ok(());
        };

        let outcome = if config.running_in_docker {
            let run = SandboxRun {
                label: ctx.label.clone(),
                task: task.clone(),
                package_dir: output.clone(),
                docker_args: format!(
                    "-w /workspace -v '{}':/workspace/actual.json -v '{}':/workspace/predicted.json",
                    dynamic.display(),
                    predicted.display()
                ),
                tool_args: "--compare-callgraphs --reachability actual.json predicted.json".to_string(),
                limits: SandboxLimits {
                    cpus: config.cpus_per_process,
                    memory: config.memory_per_process.clone(),
                },
                timeout: Some(COMPARE_TIMEOUT),
                log_path: None,
            };
            self.sandbox.run(&run).await?
        } else {
            let spec = CommandSpec::new(format!(
                "node '{}' --compare-callgraphs --reachability '{}' '{}'",
                config.analyzer_path.display(),
                dynamic.display(),
                predicted.display()
            ))
            .with_env("NODE_OPTIONS", node_options(&config.memory_per_process))
            .with_cwd(&output)
            .with_timeout(COMPARE_TIMEOUT)
            .silent();
            self.executor.run(&spec).await?
        };

        if outcome.success() {
            fs::write(output.join(output_file), outcome.tail(7)).await?;
        } else {
            fs::write(output.join(log_file), &outcome.output).await?;
        }
        check_exit(task, step, "compare_to_dynamic".to_string(), &outcome)
    }
}

async fn remove(ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
    let path = ctx.result_dir(task).join(step.required_str(&["rel_path"])?);
    match fs::symlink_metadata(&path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await?,
        Ok(_) => fs::remove_file(&path).await?,
        Err(_) => tracing::warn!(task = %task, path = %path.display(), "nothing to remove"),
    }
    Ok(())
}

async fn hard_link(ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
    let output = ctx.result_dir(task);
    let source = output.join(step.required_str(&["source_file"])?);
    let target = output.join(step.required_str(&["target_file"])?);
    if !fs::try_exists(&source).await? {
        tracing::warn!(task = %task, source = %source.display(), "link source does not exist");
        return Ok(());
    }
    link(&source, &target).await
}

async fn link_external_file(ctx: &RunContext, task: &Task, step: &Step) -> Result<()> {
    let target = ctx.result_dir(task).join(step.required_str(&["target_filename"])?);
    let source_name = step
        .str_param(&["source_name"])?
        .unwrap_or_else(|| DYNAMIC_CALLGRAPH.to_string());
    let source_dir = match step.str_param(&["source_dir"])? {
        Some(dir) => PathBuf::from(dir),
        None => ctx
            .dynamic_dir
            .clone()
            .ok_or_else(|| BenchError::invalid_param(&step.name, "source_dir", "no source or dynamic dir"))?,
    };
    match reference_artifact(&source_dir, task, &source_name).await {
        Some(source) => link(&source, &target).await,
        None => {
            tracing::warn!(task = %task, dir = %source_dir.display(), file = %source_name, "external file does not exist");
            Ok(())
        }
    }
}

/// Hard-link `source` to `target`, copying across filesystems.
async fn link(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::symlink_metadata(target).await.is_ok() {
        fs::remove_file(target).await?;
    }
    if let Err(e) = fs::hard_link(source, target).await {
        tracing::debug!(source = %source.display(), error = %e, "hard link failed, copying");
        fs::copy(source, target).await?;
    }
    Ok(())
}

/// `<dir>/<name>/<version>/<file>` for `task`, else for its parent.
async fn reference_artifact(dir: &Path, task: &Task, file: &str) -> Option<PathBuf> {
    let candidates = std::iter::once(task).chain(task.parent());
    for candidate in candidates {
        let path = dir
            .join(candidate.canonical_name())
            .join(candidate.canonical_version())
            .join(file);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Some(path);
        }
    }
    None
}

fn node_options(memory: &str) -> String {
    format!("--max-old-space-size={}", parse_memory_mb(memory).unwrap_or(0))
}

/// `<first ten characters, alphanumerics only>.log`
fn default_log_name(command: &str) -> String {
    let stem: String = command
        .chars()
        .take(10)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("{stem}.log")
}

/// Turn a failing exit into an error unless the step accepts failures.
fn check_exit(task: &Task, step: &Step, command: String, outcome: &CommandOutcome) -> Result<()> {
    if outcome.success() {
        return Ok(());
    }
    if step.bool_param(&["accept_failure"], true)? {
        tracing::warn!(task = %task, step = %step.name, exit_code = outcome.exit_code, "step exited abnormally");
        return Ok(());
    }
    Err(BenchError::ToolInvocation {
        command,
        exit_code: outcome.exit_code,
    })
}
