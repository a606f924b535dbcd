//! Benchman CLI - run analysis pipelines over package task sets.

use anyhow::{bail, Context, Result};
use benchman_core::{Config, ConfigOverrides, PipelineDescriptor, Step, Task};
use benchman_execution::{
    BatchScheduler, Parallelism, PipelineEngine, RunContext, TaskOutcome,
};
use benchman_storage::{read_task_list, read_tasks};
use benchman_tools::{CommandExecutor, CommandRunner, DockerSandbox};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Label placeholder expanded to the current local time.
const TIMESTAMP_LABEL: &str = "TIMESTAMP";

/// Tool arguments of `run-tool` when none are given.
const DEFAULT_TOOL_ARGS: &str =
    "--warnings-unsupported --callgraph-json callgraph.json --diagnostics-json diagnostics.json";

/// Mapping from task database file names to reference directories.
const DYNAMIC_DIR_MAPPING: &str = "_db2dynamic.json";

#[derive(Parser)]
#[command(name = "benchman")]
#[command(about = "Benchmark orchestration runner", long_about = None)]
struct Cli {
    /// Worker count (0 = all cores, 1 or less = sequential)
    #[arg(long, global = true, allow_negative_numbers = true)]
    processes: Option<i64>,

    /// CPU quota per worker
    #[arg(long, global = true)]
    cpus: Option<u32>,

    /// Memory quota per worker, e.g. 8g
    #[arg(long, global = true)]
    memory: Option<String>,

    /// Settings override file (default: <project>/settings-local.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project directory (default: current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis tool on every sub-project of every task
    RunTool {
        /// Task database
        #[arg(long)]
        db: PathBuf,
        /// Run label
        #[arg(long, default_value = TIMESTAMP_LABEL)]
        label: String,
        /// Tool arguments
        #[arg(long, default_value = DEFAULT_TOOL_ARGS, allow_hyphen_values = true)]
        args: String,
        /// Results of an earlier run, mounted at /old
        #[arg(long)]
        old_dir: Option<PathBuf>,
    },
    /// Run a pipeline descriptor
    Pipeline {
        /// Task database
        #[arg(long)]
        db: PathBuf,
        /// Run label
        #[arg(long, default_value = TIMESTAMP_LABEL)]
        label: String,
        /// Descriptor file, or a name below <project>/script
        #[arg(long, default_value = "pipeline")]
        script: String,
        /// Tasks never to run
        #[arg(long)]
        black_list: Option<PathBuf>,
        /// Only run these tasks
        #[arg(long)]
        white_list: Option<PathBuf>,
        /// Reference artifacts ($DYNAMIC_DIR)
        #[arg(long)]
        dynamic_dir: Option<PathBuf>,
        /// Ignore finish markers
        #[arg(long)]
        rerun: bool,
    },
    /// Fetch and install sources only
    Prepare {
        /// Task database
        #[arg(long)]
        db: PathBuf,
        /// Run label
        #[arg(long, default_value = TIMESTAMP_LABEL)]
        label: String,
        /// Delete cached sources first
        #[arg(long)]
        reinstall: bool,
    },
    /// Compare the call graphs of a run to reference call graphs
    CompareCallgraphs {
        /// Task database
        #[arg(long)]
        db: PathBuf,
        /// Reference call graphs (default: from data/_db2dynamic.json)
        #[arg(long)]
        dynamic_dir: Option<PathBuf>,
        /// Label of the run to compare
        #[arg(long)]
        label: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    let config = Config::load(project_dir, cli.config.as_deref())?.merge(ConfigOverrides {
        processes: cli.processes,
        cpus_per_process: cli.cpus,
        memory_per_process: cli.memory.clone(),
        ..Default::default()
    });

    match cli.command {
        Commands::RunTool {
            db,
            label,
            args,
            old_dir,
        } => {
            let mut step = Step::new("run_tool").with_param("args", args);
            if let Some(old) = old_dir {
                step = step.with_param("old_dir", old.display().to_string());
            }
            let descriptor = PipelineDescriptor {
                sub_tasks: vec![step],
                ..Default::default()
            };
            let tasks = read_tasks(&db).await?;
            let ctx = RunContext::new(Arc::new(config), resolve_label(&label, None));
            run_batch(descriptor, ctx, tasks).await?;
        }
        Commands::Pipeline {
            db,
            label,
            script,
            black_list,
            white_list,
            dynamic_dir,
            rerun,
        } => {
            let script = resolve_script(&config, &script);
            let descriptor = PipelineDescriptor::from_file(&script)
                .with_context(|| format!("cannot load pipeline {}", script.display()))?;
            let config = config.merge(descriptor.settings.overrides());
            let task_name = descriptor.settings.task_name().to_string();
            let label = resolve_label(&label, descriptor.settings.task_name.as_deref());
            let dynamic_dir = match dynamic_dir {
                Some(dir) => Some(dir),
                None => default_dynamic_dir(&config, &db)?,
            };

            let tasks = read_tasks(&db).await?;
            let ctx = RunContext::new(Arc::new(config), label)
                .with_task_name(task_name)
                .with_dynamic_dir(dynamic_dir)
                .with_rerun(rerun)
                .with_deny(read_task_list(black_list.as_deref()).await?.unwrap_or_default())
                .with_allow(read_task_list(white_list.as_deref()).await?);
            let (engine, ctx) = run_batch(descriptor, ctx, tasks).await?;

            let matching = engine.matching_results(&ctx).await?;
            info!(label = %ctx.label, results = matching.len(), "result entries matching the version filter");
        }
        Commands::Prepare {
            db,
            label,
            reinstall,
        } => {
            let tasks = read_tasks(&db).await?;
            let (descriptor, ctx) = prepare_run(config, &label, reinstall);
            if reinstall {
                for task in &tasks {
                    let dir = ctx.layout.package_version_dir(task);
                    if dir.exists() {
                        info!(task = %task, dir = %dir.display(), "removing cached sources");
                        tokio::fs::remove_dir_all(&dir).await?;
                    }
                }
            }
            run_batch(descriptor, ctx, tasks).await?;
        }
        Commands::CompareCallgraphs {
            db,
            dynamic_dir,
            label,
        } => {
            let dynamic_dir = match dynamic_dir {
                Some(dir) => dir,
                None => default_dynamic_dir(&config, &db)?
                    .context("no --dynamic-dir given and no mapping for this database")?,
            };
            if !dynamic_dir.is_dir() {
                bail!("dynamic dir {} is not a directory", dynamic_dir.display());
            }

            let tasks: Vec<Task> = read_tasks(&db)
                .await?
                .into_iter()
                .filter(|task| has_reference_functions(&dynamic_dir, task))
                .collect();
            if tasks.is_empty() {
                bail!("no task has a non-empty reference call graph in {}", dynamic_dir.display());
            }

            let descriptor = PipelineDescriptor {
                after: vec![Step::new("compare_to_dynamic")],
                ..Default::default()
            };
            let ctx = RunContext::new(Arc::new(config), label)
                .with_dynamic_dir(Some(dynamic_dir))
                .with_rerun(true);
            let (_, ctx) = run_batch(descriptor, ctx, tasks).await?;

            let scratch = ctx.layout.label_scratch(&ctx.label);
            if scratch.exists() {
                tokio::fs::remove_dir_all(&scratch).await?;
            }
        }
    }

    Ok(())
}

/// Run `descriptor` for every task and log a summary.
async fn run_batch(
    descriptor: PipelineDescriptor,
    ctx: RunContext,
    tasks: Vec<Task>,
) -> Result<(Arc<PipelineEngine>, Arc<RunContext>)> {
    let config = ctx.config.clone();
    let executor: Arc<dyn CommandExecutor> = Arc::new(CommandRunner::new());
    if config.running_in_docker {
        DockerSandbox::from_config(&config, executor.clone())
            .check_image()
            .await?;
    }

    let engine = Arc::new(PipelineEngine::from_config(
        Arc::new(descriptor),
        config.clone(),
        executor,
    ));
    let ctx = Arc::new(ctx);
    let scheduler = BatchScheduler::new(Parallelism::from_processes(config.processes));
    info!(label = %ctx.label, tasks = tasks.len(), "starting run");

    let outcomes = scheduler
        .run_pipeline(engine.clone(), ctx.clone(), tasks)
        .await?;
    let count = |f: fn(&TaskOutcome) -> bool| outcomes.iter().filter(|o| f(o)).count();
    let failed = count(|o| matches!(o, TaskOutcome::Failed { .. }));
    info!(
        completed = count(|o| matches!(o, TaskOutcome::Completed)),
        failed,
        excluded = count(|o| matches!(o, TaskOutcome::Excluded)),
        already_finished = count(|o| matches!(o, TaskOutcome::AlreadyFinished)),
        "run finished"
    );
    if failed > 0 {
        warn!(failed, "some tasks have failed steps, rerun to resume them");
    }
    Ok((engine, ctx))
}

/// Descriptor and context of `prepare`.
///
/// Reinstalling ignores the finish markers of earlier runs with the same label.
fn prepare_run(config: Config, label: &str, reinstall: bool) -> (PipelineDescriptor, RunContext) {
    let descriptor = PipelineDescriptor {
        before: vec![Step::new("prepare").with_param("rerun", reinstall)],
        ..Default::default()
    };
    let ctx = RunContext::new(Arc::new(config), resolve_label(label, None)).with_rerun(reinstall);
    (descriptor, ctx)
}

/// Expand [`TIMESTAMP_LABEL`] to the local time, prefixed by the task name.
fn resolve_label(label: &str, task_name: Option<&str>) -> String {
    if label != TIMESTAMP_LABEL {
        return label.to_string();
    }
    let stamp = chrono::Local::now().format("%Y-%m-%d#%H.%M.%S").to_string();
    match task_name {
        Some(name) => format!("{name}-{stamp}"),
        None => stamp,
    }
}

/// Descriptor path for `--script`: a file path, or a name below the script dir.
fn resolve_script(config: &Config, script: &str) -> PathBuf {
    if script.ends_with(".json") {
        PathBuf::from(script)
    } else {
        config.script_dir().join(format!("{script}.json"))
    }
}

/// Reference dir mapped to the database's file name, if any.
fn default_dynamic_dir(config: &Config, db: &Path) -> Result<Option<PathBuf>> {
    let mapping = config.data_dir().join(DYNAMIC_DIR_MAPPING);
    if !mapping.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&mapping)?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("malformed {}", mapping.display()))?;
    let key = db
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(map
        .get(&key)
        .and_then(|v| v.as_str())
        .map(|dir| config.project_dir.join(dir)))
}

/// Whether the reference call graph of `task` lists any function.
fn has_reference_functions(dynamic_dir: &Path, task: &Task) -> bool {
    let path = dynamic_dir
        .join(task.canonical_name())
        .join(task.canonical_version())
        .join("dynamic_callgraph.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => match json.get("functions") {
            Some(serde_json::Value::Array(items)) => !items.is_empty(),
            Some(serde_json::Value::Object(items)) => !items.is_empty(),
            _ => false,
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed reference call graph");
            false
        }
    }
}
