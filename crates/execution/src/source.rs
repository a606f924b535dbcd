//! Source acquisition: fetch a package into the cache, then install its
//! dependencies.
//!
//! The two stages are separate traits so callers compose them explicitly and
//! tests can count invocations. [`SourcePreparer`] is the composition used by
//! the engine.

use crate::context::RunContext;
use crate::discovery;
use async_trait::async_trait;
use benchman_core::{BenchError, Config, Result, Task};
use benchman_storage::{FinishMarker, Layout};
use benchman_tools::{
    CommandExecutor, CommandOutcome, CommandSpec, DockerSandbox, SandboxLimits, SandboxRun,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// Descriptor whose presence means the sources are already fetched.
pub const FETCHED_MARKER: &str = "package.json";

/// Directory whose presence means the dependencies are already installed.
pub const INSTALLED_MARKER: &str = "node_modules";

/// Log artifact written next to the sources by each install attempt.
pub const INSTALL_LOG: &str = ".benchman-install.log";

const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const PACK_TIMEOUT: Duration = Duration::from_secs(600);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Fetches the sources of a task.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Make sure the sources of `task` are on disk and return their directory.
    async fn ensure(&self, task: &Task) -> Result<PathBuf>;
}

/// Installs the dependencies of fetched sources.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Make sure the dependencies of `task`, fetched into `dir`, are installed.
    async fn ensure(&self, task: &Task, dir: &Path) -> Result<()>;
}

/// Downloads registry packages and shallow-clones repositories.
pub struct PackageFetcher {
    layout: Layout,
    executor: Arc<dyn CommandExecutor>,
}

impl PackageFetcher {
    /// Fetcher writing below `layout`'s packages root.
    pub fn new(layout: Layout, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { layout, executor }
    }

    async fn run(&self, task: &Task, spec: CommandSpec) -> Result<CommandOutcome> {
        let outcome = self.executor.run(&spec).await?;
        if !outcome.success() {
            return Err(BenchError::Fetch {
                task: task.to_string(),
                reason: format!("`{}` exited with {}: {}", spec.command, outcome.exit_code, outcome.tail(5)),
            });
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Fetcher for PackageFetcher {
    async fn ensure(&self, task: &Task) -> Result<PathBuf> {
        let version_dir = self.layout.package_version_dir(task);
        if !task.is_fetchable() {
            return Ok(task.dir(self.layout.packages_root()));
        }
        if fs::try_exists(version_dir.join(FETCHED_MARKER)).await? {
            tracing::debug!(task = %task, "sources already fetched");
            return Ok(version_dir);
        }
        if fs::try_exists(&version_dir).await? {
            fs::remove_dir_all(&version_dir).await?;
        }
        fs::create_dir_all(&version_dir).await?;
        tracing::info!(task = %task, dir = %version_dir.display(), "fetching sources");

        match task {
            Task::Registry { name, version } => {
                let package_dir = self.layout.package_dir(task);
                let tarball = format!("{}-{version}.tgz", name.replace('/', "-").replace('@', ""));
                let pack = CommandSpec::new(format!("npm pack --silent '{name}@{version}'"))
                    .with_cwd(&package_dir)
                    .with_timeout(PACK_TIMEOUT)
                    .silent();
                self.run(task, pack).await?;
                let unpack = CommandSpec::new(format!(
                    "tar -zxf '{tarball}' -C '{}' --strip-components=1 && rm -rf '{tarball}'",
                    version_dir.display()
                ))
                .with_cwd(&package_dir)
                .silent();
                self.run(task, unpack).await?;
            }
            Task::Repository { repo, commit } => {
                let clone = CommandSpec::new(format!(
                    "git init -q && git config advice.detachedHead false && \
                     git remote add origin https://github.com/{repo}.git && \
                     git fetch -q --depth 1 origin {commit} && git checkout -q FETCH_HEAD"
                ))
                .with_cwd(&version_dir)
                .with_timeout(FETCH_TIMEOUT)
                .silent();
                self.run(task, clone).await?;
            }
            _ => {}
        }

        if !fs::try_exists(version_dir.join(FETCHED_MARKER)).await? {
            tracing::warn!(task = %task, "fetched sources have no {FETCHED_MARKER}");
        }
        Ok(version_dir)
    }
}

/// Package manager used for one install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// `npm install`, also the fallback of the others
    Npm,
    /// `pnpm install` with a hoisted layout
    Pnpm,
    /// `yarn install` with a node-modules linker
    Yarn,
}

impl PackageManager {
    /// Primary manager for a project descriptor found in `dir`.
    pub fn detect(descriptor: &Value, dir: &Path, prefer_pnpm: bool) -> Self {
        let has = |name: &str| dir.join(name).exists();
        let workspaces = descriptor.get("workspaces").is_some();
        if !workspaces
            && (prefer_pnpm || has("pnpm-lock.yaml") || has("pnpm-workspace.yaml"))
        {
            return PackageManager::Pnpm;
        }
        let declares_yarn = descriptor
            .get("packageManager")
            .and_then(|v| v.as_str())
            .is_some_and(|m| m.contains("yarn"));
        if has("yarn.lock") || declares_yarn {
            return PackageManager::Yarn;
        }
        PackageManager::Npm
    }

    fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }
}

/// Installs dependencies with pnpm or yarn and falls back to npm.
pub struct NpmInstaller {
    config: Arc<Config>,
    executor: Arc<dyn CommandExecutor>,
    sandbox: Arc<DockerSandbox>,
}

impl NpmInstaller {
    /// Installer driven by `config`.
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn CommandExecutor>,
        sandbox: Arc<DockerSandbox>,
    ) -> Self {
        Self {
            config,
            executor,
            sandbox,
        }
    }

    /// Directories to install into: the root for yarn, else every
    /// sub-project that has no dependencies yet.
    async fn targets(&self, task: &Task, dir: &Path, manager: PackageManager) -> Result<Vec<PathBuf>> {
        let mut dirs = vec![dir.to_path_buf()];
        if manager != PackageManager::Yarn {
            for found in discovery::discover(task, dir, self.config.max_sub_packages).await? {
                if let Some(parent) = found.source.parent() {
                    if !dirs.iter().any(|d| d == parent) {
                        dirs.push(parent.to_path_buf());
                    }
                }
            }
        }
        let mut pending = Vec::new();
        for d in dirs {
            if !fs::try_exists(d.join(INSTALLED_MARKER)).await? {
                pending.push(d);
            }
        }
        Ok(pending)
    }

    async fn install(&self, task: &Task, dir: &Path, manager: PackageManager) -> Result<bool> {
        let log = dir.join(INSTALL_LOG);
        let spec = match manager {
            PackageManager::Pnpm => {
                let lockfile = dir.join("pnpm-lock.yaml");
                let had_lockfile = fs::try_exists(&lockfile).await?;
                let import = if had_lockfile { "" } else { "pnpm import --silent; " };
                let cleanup = if had_lockfile {
                    ""
                } else {
                    "; status=$?; rm -f pnpm-lock.yaml; exit $status"
                };
                CommandSpec::new(format!(
                    "{import}pnpm install --silent --ignore-scripts \
                     --config.prefer-symlinked-executables=true --config.node-linker=hoisted \
                     --config.resolution-mode=highest{cleanup}"
                ))
            }
            PackageManager::Yarn => {
                let lockfile = dir.join("yarn.lock");
                let created = !fs::try_exists(&lockfile).await?;
                if created {
                    fs::write(&lockfile, "").await?;
                }
                let cleanup = if created { "; status=$?; rm -f yarn.lock; exit $status" } else { "" };
                CommandSpec::new(format!(
                    "corepack enable && yarn config set nodeLinker node-modules && yarn install{cleanup}"
                ))
            }
            PackageManager::Npm if self.config.running_in_docker => {
                let run = SandboxRun {
                    label: "install".to_string(),
                    task: task.clone(),
                    package_dir: dir.to_path_buf(),
                    docker_args: "-w /package --entrypoint /bin/sh".to_string(),
                    tool_args: "-c 'npm install --quiet --force'".to_string(),
                    limits: SandboxLimits {
                        cpus: self.config.cpus_per_process,
                        memory: self.config.memory_per_process.clone(),
                    },
                    timeout: Some(INSTALL_TIMEOUT),
                    log_path: Some(log),
                };
                return Ok(self.sandbox.run(&run).await?.success());
            }
            PackageManager::Npm => CommandSpec::new("npm install --quiet --force --ignore-scripts")
                .with_env("COREPACK_ENABLE_NETWORK", "1")
                .with_env("CI", "true"),
        };
        let spec = spec.with_cwd(dir).with_timeout(INSTALL_TIMEOUT).silent();
        let outcome = self.executor.run_and_log(&spec, &log).await?;
        if !outcome.success() {
            return Ok(false);
        }

        if manager == PackageManager::Pnpm
            && self.config.test_after_install
            && matches!(task, Task::Repository { .. })
        {
            let test = CommandSpec::new("pnpm test")
                .with_cwd(dir)
                .with_timeout(INSTALL_TIMEOUT)
                .silent();
            let outcome = self.executor.run(&test).await?;
            if !outcome.success() {
                tracing::warn!(task = %task, dir = %dir.display(), "tests fail after pnpm install");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn remove_dependencies(dir: &Path) {
        let modules = dir.join(INSTALLED_MARKER);
        if let Err(e) = fs::remove_dir_all(&modules).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %modules.display(), error = %e, "failed to remove dependencies");
            }
        }
    }
}

#[async_trait]
impl Installer for NpmInstaller {
    async fn ensure(&self, task: &Task, dir: &Path) -> Result<()> {
        let descriptor_path = dir.join(FETCHED_MARKER);
        let text = match fs::read_to_string(&descriptor_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(task = %task, "no project descriptor, nothing to install");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let descriptor: Value = serde_json::from_str(&text).map_err(|e| BenchError::Install {
            task: task.to_string(),
            reason: format!("malformed {}: {e}", descriptor_path.display()),
        })?;

        let manager = PackageManager::detect(&descriptor, dir, self.config.use_pnpm);
        let mut failed = Vec::new();
        for target in self.targets(task, dir, manager).await? {
            tracing::info!(task = %task, dir = %target.display(), manager = manager.as_str(), "installing dependencies");
            let mut installed = self.install(task, &target, manager).await?;
            if !installed && manager != PackageManager::Npm {
                tracing::warn!(task = %task, dir = %target.display(), "{} install failed, falling back to npm", manager.as_str());
                Self::remove_dependencies(&target).await;
                installed = self.install(task, &target, PackageManager::Npm).await?;
            }
            if !installed {
                tracing::warn!(task = %task, dir = %target.display(), "dependency install failed");
                Self::remove_dependencies(&target).await;
                failed.push(target.display().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(BenchError::Install {
                task: task.to_string(),
                reason: format!("no package manager succeeded in {}", failed.join(", ")),
            })
        }
    }
}

/// Fetch then install, memoized per top-level task.
pub struct SourcePreparer {
    fetcher: Arc<dyn Fetcher>,
    installer: Arc<dyn Installer>,
}

impl SourcePreparer {
    /// Compose a fetcher and an installer.
    pub fn new(fetcher: Arc<dyn Fetcher>, installer: Arc<dyn Installer>) -> Self {
        Self { fetcher, installer }
    }

    /// The production preparer for `config`.
    pub fn from_config(
        config: Arc<Config>,
        executor: Arc<dyn CommandExecutor>,
        sandbox: Arc<DockerSandbox>,
    ) -> Self {
        let fetcher = PackageFetcher::new(Layout::from_config(&config), executor.clone());
        let installer = NpmInstaller::new(config, executor, sandbox);
        Self::new(Arc::new(fetcher), Arc::new(installer))
    }

    /// Prepare the sources `task` belongs to.
    ///
    /// Returns the source directory, or `None` when the task has nothing to
    /// download. `force` ignores an earlier successful preparation.
    pub async fn prepare(&self, ctx: &RunContext, task: &Task, force: bool) -> Result<Option<PathBuf>> {
        let top = task.parent().unwrap_or(task);
        if !top.is_fetchable() {
            return Ok(None);
        }
        let markers = ctx.markers(top);
        if !force && markers.contains(&FinishMarker::PrepareAll).await {
            tracing::debug!(task = %top, "sources already prepared");
            return Ok(Some(ctx.layout.package_version_dir(top)));
        }

        let dir = self.fetcher.ensure(top).await?;
        if !fs::try_exists(dir.join(INSTALLED_MARKER)).await? {
            self.installer.ensure(top, &dir).await?;
        }
        markers.mark(&FinishMarker::PrepareAll).await?;
        Ok(Some(dir))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Executor that records commands and answers with a fixed exit code.
    #[derive(Default)]
    pub(crate) struct Scripted {
        pub commands: Mutex<Vec<String>>,
        pub fail_when: Option<&'static str>,
    }

    impl Scripted {
        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for Scripted {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
            self.commands.lock().unwrap().push(spec.command.clone());
            let failed = self.fail_when.is_some_and(|needle| spec.command.contains(needle));
            Ok(CommandOutcome {
                output: String::new(),
                exit_code: if failed { 1 } else { 0 },
                duration: Duration::ZERO,
                timed_out: false,
            })
        }

        async fn run_and_log(&self, spec: &CommandSpec, log: &Path) -> Result<CommandOutcome> {
            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(log, &spec.command)?;
            self.run(spec).await
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingFetcher {
        pub calls: AtomicUsize,
        pub dir: PathBuf,
        pub unreachable: bool,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn ensure(&self, task: &Task) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(BenchError::Fetch {
                    task: task.to_string(),
                    reason: "registry unreachable".to_string(),
                });
            }
            Ok(self.dir.clone())
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingInstaller {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Installer for CountingInstaller {
        async fn ensure(&self, _task: &Task, _dir: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn installer(config: Config, executor: Arc<Scripted>) -> NpmInstaller {
        let sandbox = Arc::new(DockerSandbox::new("docker", "analyzer", executor.clone()).with_rootless(true));
        NpmInstaller::new(Arc::new(config), executor, sandbox)
    }

    #[tokio::test]
    async fn test_fetch_is_memoized_by_descriptor() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path());
        let layout = Layout::from_config(&config);
        let task = Task::registry("left-pad", "1.3.0");
        let version_dir = layout.package_version_dir(&task);
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join(FETCHED_MARKER), "{}").unwrap();

        let executor = Arc::new(Scripted::default());
        let fetcher = PackageFetcher::new(layout, executor.clone());
        assert_eq!(fetcher.ensure(&task).await.unwrap(), version_dir);
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_registry_commands() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path());
        let executor = Arc::new(Scripted::default());
        let fetcher = PackageFetcher::new(Layout::from_config(&config), executor.clone());

        fetcher.ensure(&Task::registry("@scope/pkg", "2.0.0")).await.unwrap();
        let commands = executor.commands();
        assert_eq!(commands[0], "npm pack --silent '@scope/pkg@2.0.0'");
        assert!(commands[1].starts_with("tar -zxf 'scope-pkg-2.0.0.tgz'"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path());
        let executor = Arc::new(Scripted {
            fail_when: Some("git fetch"),
            ..Default::default()
        });
        let fetcher = PackageFetcher::new(Layout::from_config(&config), executor);
        let err = fetcher.ensure(&Task::repository("o/r", "c1")).await.unwrap_err();
        assert!(matches!(err, BenchError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_detect_package_manager() {
        let dir = TempDir::new().unwrap();
        let plain = serde_json::json!({"name": "a"});
        assert_eq!(PackageManager::detect(&plain, dir.path(), false), PackageManager::Npm);
        assert_eq!(PackageManager::detect(&plain, dir.path(), true), PackageManager::Pnpm);

        let workspaces = serde_json::json!({"workspaces": ["packages/*"], "packageManager": "yarn@4.0.0"});
        assert_eq!(PackageManager::detect(&workspaces, dir.path(), true), PackageManager::Yarn);

        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(PackageManager::detect(&plain, dir.path(), false), PackageManager::Pnpm);
    }

    #[tokio::test]
    async fn test_install_falls_back_to_npm() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(FETCHED_MARKER), r#"{"name": "a", "version": "1.0.0"}"#).unwrap();
        let mut config = Config::new(dir.path());
        config.use_pnpm = true;
        let executor = Arc::new(Scripted {
            fail_when: Some("pnpm install"),
            ..Default::default()
        });

        installer(config, executor.clone())
            .ensure(&Task::registry("a", "1.0.0"), dir.path())
            .await
            .unwrap();
        let commands = executor.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("pnpm install"));
        assert_eq!(commands[1], "npm install --quiet --force --ignore-scripts");
    }

    #[tokio::test]
    async fn test_install_without_descriptor_is_noop() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(Scripted::default());
        installer(Config::new(dir.path()), executor.clone())
            .ensure(&Task::registry("a", "1.0.0"), dir.path())
            .await
            .unwrap();
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_install_malformed_descriptor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(FETCHED_MARKER), "{ nope").unwrap();
        let executor = Arc::new(Scripted::default());
        let err = installer(Config::new(dir.path()), executor)
            .ensure(&Task::registry("a", "1.0.0"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Install { .. }));
    }

    #[tokio::test]
    async fn test_install_exhausted_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(FETCHED_MARKER), r#"{"name": "a"}"#).unwrap();
        let executor = Arc::new(Scripted {
            fail_when: Some("install"),
            ..Default::default()
        });
        let err = installer(Config::new(dir.path()), executor)
            .ensure(&Task::registry("a", "1.0.0"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Install { .. }));
        assert!(!dir.path().join(INSTALLED_MARKER).exists());
    }

    #[tokio::test]
    async fn test_prepare_runs_once() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(Arc::new(Config::new(dir.path())), "run");
        let fetcher = Arc::new(CountingFetcher {
            dir: dir.path().join("src"),
            ..Default::default()
        });
        let installer = Arc::new(CountingInstaller::default());
        let preparer = SourcePreparer::new(fetcher.clone(), installer.clone());
        let task = Task::registry("left-pad", "1.3.0");

        preparer.prepare(&ctx, &task, false).await.unwrap();
        preparer.prepare(&ctx, &task, false).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);

        preparer.prepare(&ctx, &task, true).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        assert_eq!(preparer.prepare(&ctx, &Task::url("https://x.org/a"), false).await.unwrap(), None);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
