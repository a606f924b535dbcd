//! Container sandbox.
//!
//! Tools run in a throwaway container with CPU and memory quotas, no network
//! and the package mounted read-write at `/package`. The container is named
//! after the task, so an operator can find it, and it is stopped and removed
//! explicitly whenever the run does not end normally: `--rm` only fires when
//! the container exits on its own.

use crate::runner::{CommandExecutor, CommandOutcome, CommandSpec, ABNORMAL_EXIT};
use benchman_core::{BenchError, Config, Result, Task};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Mount point of the package inside the container.
pub const PACKAGE_MOUNT: &str = "/package";

/// Limit for each container CLI call made while cleaning up.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic container name for `task` in run `label`.
pub fn container_name(label: &str, task: &Task) -> String {
    let raw = format!(
        "bench-{}-{}-{}",
        label,
        task.canonical_name(),
        task.canonical_version()
    )
    .replace('#', "--")
    .replace(['@', '!'], "");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Resource quota of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// CPU quota
    pub cpus: u32,
    /// Memory quota, e.g. `8g`
    pub memory: String,
}

/// One sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Run label, part of the container name
    pub label: String,
    /// Task the run belongs to
    pub task: Task,
    /// Host directory mounted at [`PACKAGE_MOUNT`]
    pub package_dir: PathBuf,
    /// Extra `docker run` flags placed before the image
    pub docker_args: String,
    /// Command and arguments placed after the image
    pub tool_args: String,
    /// Resource quota
    pub limits: SandboxLimits,
    /// Wall-clock limit
    pub timeout: Option<Duration>,
    /// Log artifact; output is only captured in memory when absent
    pub log_path: Option<PathBuf>,
}

/// Runs commands inside containers.
pub struct DockerSandbox {
    runtime: String,
    image: String,
    executor: Arc<dyn CommandExecutor>,
    rootless: OnceCell<bool>,
}

impl DockerSandbox {
    /// Sandbox using container CLI `runtime` and `image`.
    pub fn new(
        runtime: impl Into<String>,
        image: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            executor,
            rootless: OnceCell::new(),
        }
    }

    /// Sandbox described by a configuration.
    pub fn from_config(config: &Config, executor: Arc<dyn CommandExecutor>) -> Self {
        Self::new(&config.container_runtime, &config.sandbox_image, executor)
    }

    /// Builder: skip rootless detection.
    pub fn with_rootless(self, rootless: bool) -> Self {
        let _ = self.rootless.set(rootless);
        self
    }

    /// Image used for runs.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Whether the container runtime runs rootless. Detected once.
    pub async fn is_rootless(&self) -> bool {
        *self
            .rootless
            .get_or_init(|| async {
                let spec = CommandSpec::new(format!(
                    "{} info --format '{{{{join .SecurityOptions \"\\n\"}}}}'",
                    self.runtime
                ))
                .silent();
                match self.executor.run(&spec).await {
                    Ok(outcome) if outcome.success() => {
                        outcome.output.lines().any(|l| l.trim() == "name=rootless")
                    }
                    Ok(outcome) => {
                        tracing::warn!(exit_code = outcome.exit_code, "container runtime info failed, assuming rootful");
                        false
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "container runtime info failed, assuming rootful");
                        false
                    }
                }
            })
            .await
    }

    /// Fail unless the image is present locally.
    pub async fn check_image(&self) -> Result<()> {
        let spec = CommandSpec::new(format!("{} image inspect {}", self.runtime, self.image)).silent();
        let outcome = self.executor.run(&spec).await.map_err(|e| {
            BenchError::Sandbox(format!("container runtime `{}` unavailable: {e}", self.runtime))
        })?;
        if !outcome.success() {
            return Err(BenchError::Sandbox(format!(
                "image `{}` not found, build it first",
                self.image
            )));
        }
        Ok(())
    }

    /// The `docker run` command line for `run`.
    pub async fn command_line(&self, run: &SandboxRun) -> String {
        let user = if self.is_rootless().await {
            String::new()
        } else {
            let (uid, gid) = current_ids();
            format!("--user {uid}:{gid} -e HOME=/tmp ")
        };
        let mut parts = vec![
            format!("{} run", self.runtime),
            format!("--cpus={}", run.limits.cpus),
            format!("--memory={}", run.limits.memory),
            "--rm --ulimit core=0 --network none".to_string(),
            format!("--name {}", container_name(&run.label, &run.task)),
            format!("-v '{}':{}", run.package_dir.display(), PACKAGE_MOUNT),
        ];
        parts.push(format!("{user}{}", run.docker_args).trim().to_string());
        parts.push(self.image.clone());
        parts.push(run.tool_args.clone());
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    /// Run `run` inside a container.
    pub async fn run(&self, run: &SandboxRun) -> Result<CommandOutcome> {
        let name = container_name(&run.label, &run.task);
        let mut spec = CommandSpec::new(self.command_line(run).await);
        spec.timeout = run.timeout;

        let mut guard = CancelGuard {
            executor: self.executor.clone(),
            runtime: self.runtime.clone(),
            name,
            armed: true,
        };
        let result = match &run.log_path {
            Some(path) => self.executor.run_and_log(&spec, path).await,
            None => self.executor.run(&spec).await,
        };
        guard.armed = false;
        if !matches!(&result, Ok(outcome) if outcome.exit_code != ABNORMAL_EXIT) {
            remove_container(self.executor.as_ref(), &self.runtime, &guard.name).await;
        }
        result
    }
}

/// Stop and force-remove container `name` if it still exists.
async fn remove_container(executor: &dyn CommandExecutor, runtime: &str, name: &str) {
    let call = |args: String| {
        CommandSpec::new(format!("{runtime} {args}"))
            .with_timeout(CLEANUP_TIMEOUT)
            .silent()
    };
    match executor.run(&call(format!("container inspect {name}"))).await {
        Ok(outcome) if outcome.success() => {}
        _ => return,
    }
    tracing::warn!(container = %name, "stopping container after abnormal end");
    for args in [format!("stop {name}"), format!("rm -f {name}")] {
        match executor.run(&call(args)).await {
            Ok(outcome) if outcome.success() => {}
            Ok(outcome) => {
                tracing::error!(container = %name, exit_code = outcome.exit_code, "container cleanup failed");
            }
            Err(e) => tracing::error!(container = %name, error = %e, "container cleanup failed"),
        }
    }
}

/// Removes the container in the background when a run is cancelled.
struct CancelGuard {
    executor: Arc<dyn CommandExecutor>,
    runtime: String,
    name: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(container = %self.name, "no runtime left, container not removed");
            return;
        };
        let executor = self.executor.clone();
        let runtime = std::mem::take(&mut self.runtime);
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            remove_container(executor.as_ref(), &runtime, &name).await;
        });
    }
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (0, 0)
}
