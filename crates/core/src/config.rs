//! Runner configuration.
//!
//! A [`Config`] is built once from defaults and a chain of optional
//! [`ConfigOverrides`] (local settings file, environment, command line,
//! pipeline settings) and is then shared read-only.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the optional local override placed in the project dir.
pub const LOCAL_SETTINGS_FILE: &str = "settings-local.json";

/// Environment variable naming the security scanner installation.
pub const CODE_QL_HOME_ENV: &str = "CODE_QL_HOME";

/// Immutable runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Base for default directories, `script/` and `data/`
    pub project_dir: PathBuf,

    /// Package cache root
    pub packages_dir: PathBuf,

    /// Results root
    pub results_dir: PathBuf,

    /// Scratch root
    pub scratch_dir: PathBuf,

    /// Worker count; 0 means all cores, 1 or less runs sequentially
    pub processes: i64,

    /// Sandbox CPU quota and tool thread count
    pub cpus_per_process: u32,

    /// Sandbox memory quota, e.g. `30g`
    pub memory_per_process: String,

    /// Default tool timeout in seconds
    pub timeout_secs: u64,

    /// Prefer pnpm over npm for installs
    pub use_pnpm: bool,

    /// Run tools in the sandbox unless a step says otherwise
    pub running_in_docker: bool,

    /// Fetch and install sources before steps that need them
    pub install_dependencies: bool,

    /// Verify pnpm installs of repositories by running their tests
    pub test_after_install: bool,

    /// Security scanner installation
    pub codeql_home: PathBuf,

    /// Upper bound on sub-projects discovered per parent task
    pub max_sub_packages: usize,

    /// Analysis tool entry point
    pub analyzer_path: PathBuf,

    /// Container image used for sandboxed runs
    pub sandbox_image: String,

    /// Container CLI
    pub container_runtime: String,
}

impl Config {
    /// Defaults rooted at `project_dir`.
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            packages_dir: project_dir.join("dataset"),
            results_dir: project_dir.join("results"),
            scratch_dir: project_dir.join("tmp"),
            analyzer_path: project_dir.join("..").join("analyzer").join("lib"),
            project_dir,
            processes: 4,
            cpus_per_process: 4,
            memory_per_process: "30g".to_string(),
            timeout_secs: 60 * 40,
            use_pnpm: false,
            running_in_docker: false,
            install_dependencies: true,
            test_after_install: false,
            codeql_home: PathBuf::from("/codeql-home"),
            max_sub_packages: 987_654_321,
            sandbox_image: "analyzer".to_string(),
            container_runtime: "docker".to_string(),
        }
    }

    /// Defaults, then the local settings file when it exists, then the
    /// environment.
    ///
    /// `override_file` replaces the lookup of [`LOCAL_SETTINGS_FILE`].
    pub fn load(project_dir: impl Into<PathBuf>, override_file: Option<&Path>) -> Result<Self> {
        let config = Self::new(project_dir);
        let local = config.project_dir.join(LOCAL_SETTINGS_FILE);
        let config = match override_file {
            Some(path) => config.merge(ConfigOverrides::from_file(path)?),
            None if local.is_file() => config.merge(ConfigOverrides::from_file(&local)?),
            None => config,
        };
        Ok(config.merge(ConfigOverrides::from_env(|key| std::env::var(key).ok())))
    }

    /// Apply every `Some` field of `overrides`.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = overrides.$field {
                    self.$field = value;
                })*
            };
        }
        apply!(
            packages_dir,
            results_dir,
            scratch_dir,
            processes,
            cpus_per_process,
            memory_per_process,
            timeout_secs,
            use_pnpm,
            running_in_docker,
            install_dependencies,
            test_after_install,
            codeql_home,
            max_sub_packages,
            analyzer_path,
            sandbox_image,
            container_runtime,
        );
        self
    }

    /// Memory quota in megabytes, 0 when the quota string is malformed.
    pub fn memory_mb(&self) -> u64 {
        parse_memory_mb(&self.memory_per_process).unwrap_or(0)
    }

    /// Directory holding named pipeline scripts.
    pub fn script_dir(&self) -> PathBuf {
        self.project_dir.join("script")
    }

    /// Directory holding auxiliary data files.
    pub fn data_dir(&self) -> PathBuf {
        self.project_dir.join("data")
    }
}

/// Partial configuration; `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    /// See [`Config::packages_dir`]
    pub packages_dir: Option<PathBuf>,
    /// See [`Config::results_dir`]
    pub results_dir: Option<PathBuf>,
    /// See [`Config::scratch_dir`]
    pub scratch_dir: Option<PathBuf>,
    /// See [`Config::processes`]
    pub processes: Option<i64>,
    /// See [`Config::cpus_per_process`]
    pub cpus_per_process: Option<u32>,
    /// See [`Config::memory_per_process`]
    pub memory_per_process: Option<String>,
    /// See [`Config::timeout_secs`]
    pub timeout_secs: Option<u64>,
    /// See [`Config::use_pnpm`]
    pub use_pnpm: Option<bool>,
    /// See [`Config::running_in_docker`]
    pub running_in_docker: Option<bool>,
    /// See [`Config::install_dependencies`]
    pub install_dependencies: Option<bool>,
    /// See [`Config::test_after_install`]
    pub test_after_install: Option<bool>,
    /// See [`Config::codeql_home`]
    pub codeql_home: Option<PathBuf>,
    /// See [`Config::max_sub_packages`]
    pub max_sub_packages: Option<usize>,
    /// See [`Config::analyzer_path`]
    pub analyzer_path: Option<PathBuf>,
    /// See [`Config::sandbox_image`]
    pub sandbox_image: Option<String>,
    /// See [`Config::container_runtime`]
    pub container_runtime: Option<String>,
}

impl ConfigOverrides {
    /// Read overrides from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| BenchError::malformed(path.display().to_string(), e))
    }

    /// Overrides taken from the environment through `lookup`.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            codeql_home: lookup(CODE_QL_HOME_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ..Default::default()
        }
    }
}

/// Parse a memory quota (`30g`, `512m`, `2048k`, `4096`) into megabytes.
pub fn parse_memory_mb(memory: &str) -> Option<u64> {
    let memory = memory.trim().to_lowercase();
    let (number, factor) = if let Some(n) = memory.strip_suffix('g') {
        (n, 1024.0)
    } else if let Some(n) = memory.strip_suffix('m') {
        (n, 1.0)
    } else if let Some(n) = memory.strip_suffix('k') {
        (n, 1.0 / 1024.0)
    } else {
        return memory.parse().ok();
    };
    let value: f64 = number.trim().parse().ok()?;
    if value.is_sign_negative() || !value.is_finite() {
        return None;
    }
    Some((value * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::new("/work");
        assert_eq!(config.packages_dir, PathBuf::from("/work/dataset"));
        assert_eq!(config.results_dir, PathBuf::from("/work/results"));
        assert_eq!(config.processes, 4);
        assert_eq!(config.timeout_secs, 2400);
        assert_eq!(config.memory_mb(), 30 * 1024);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_mb("30g"), Some(30720));
        assert_eq!(parse_memory_mb("1.5G"), Some(1536));
        assert_eq!(parse_memory_mb("512m"), Some(512));
        assert_eq!(parse_memory_mb("2048k"), Some(2));
        assert_eq!(parse_memory_mb(" 4096 "), Some(4096));
        assert_eq!(parse_memory_mb("lots"), None);
    }

    #[test]
    fn test_merge_only_touches_set_fields() {
        let config = Config::new("/work").merge(ConfigOverrides {
            processes: Some(0),
            memory_per_process: Some("8g".into()),
            ..Default::default()
        });
        assert_eq!(config.processes, 0);
        assert_eq!(config.memory_per_process, "8g");
        assert_eq!(config.cpus_per_process, 4);
        assert_eq!(config.packages_dir, PathBuf::from("/work/dataset"));
    }

    #[test]
    fn test_env_override() {
        let overrides = ConfigOverrides::from_env(|key| {
            (key == CODE_QL_HOME_ENV).then(|| "/opt/codeql".to_string())
        });
        let config = Config::new("/work").merge(overrides);
        assert_eq!(config.codeql_home, PathBuf::from("/opt/codeql"));
    }

    #[test]
    fn test_load_local_settings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LOCAL_SETTINGS_FILE),
            r#"{"processes": 16, "timeout_secs": 60}"#,
        )
        .unwrap();

        let config = Config::load(dir.path(), None).unwrap();
        assert_eq!(config.processes, 16);
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_malformed_override_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"processes": "#).unwrap();

        let err = Config::load(dir.path(), Some(&path)).unwrap_err();
        assert!(matches!(err, BenchError::MalformedDescriptor { .. }));
    }
}
