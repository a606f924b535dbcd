//! Pipeline descriptor model.
//!
//! ```json
//! {
//!   "settings": {"parallel": 8, "task_name": "bundles"},
//!   "before": [{"name": "exec_command", "command": "echo hi"}],
//!   "sub_tasks": [{"name": "run_tool", "args": "--diagnostics"}],
//!   "after": []
//! }
//! ```

use crate::config::ConfigOverrides;
use crate::error::{BenchError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Task name used when the descriptor does not set one.
pub const DEFAULT_TASK_NAME: &str = "sqlite";

/// A parsed pipeline descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    /// Run-wide settings
    #[serde(default)]
    pub settings: PipelineSettings,

    /// Steps run once per task before sub-projects
    #[serde(default)]
    pub before: Vec<Step>,

    /// Steps replayed for every discovered sub-project
    #[serde(default)]
    pub sub_tasks: Vec<Step>,

    /// Steps run once per task after sub-projects
    #[serde(default)]
    pub after: Vec<Step>,

    /// Report builders; accepted but not executed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub db_builders: Vec<Value>,
}

impl PipelineDescriptor {
    /// Parse descriptor text. `source` names the document in errors.
    pub fn parse(text: &str, source: &str) -> Result<Self> {
        let descriptor: Self =
            serde_json::from_str(text).map_err(|e| BenchError::malformed(source, e))?;
        descriptor.settings.version_regex().map_err(|e| match e {
            BenchError::MalformedDescriptor { reason, .. } => BenchError::malformed(source, reason),
            other => other,
        })?;
        Ok(descriptor)
    }

    /// Read and parse a descriptor file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Whether any phase has steps.
    pub fn has_steps(&self) -> bool {
        !(self.before.is_empty() && self.sub_tasks.is_empty() && self.after.is_empty())
    }
}

/// The `settings` object of a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Worker count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<i64>,

    /// Per-worker CPU quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_per_process: Option<u32>,

    /// Per-worker memory quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_per_process: Option<String>,

    /// Name of the run, prefixed to timestamp labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    /// Filter for result versions counted after the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_pattern: Option<String>,

    /// Keys consumed by report builders
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineSettings {
    /// Configuration overrides carried by these settings.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            processes: self.parallel,
            cpus_per_process: self.cpu_per_process,
            memory_per_process: self.mem_per_process.clone(),
            ..Default::default()
        }
    }

    /// `task_name`, or [`DEFAULT_TASK_NAME`].
    pub fn task_name(&self) -> &str {
        self.task_name.as_deref().unwrap_or(DEFAULT_TASK_NAME)
    }

    /// Compiled `version_pattern`, if any.
    pub fn version_regex(&self) -> Result<Option<Regex>> {
        self.version_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| BenchError::malformed("settings.version_pattern", e))
            })
            .transpose()
    }
}

/// One step: an operation name plus its flat parameter map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Operation name
    pub name: String,

    /// Parameters
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Step {
    /// Step with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Builder: set a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// First parameter present among `keys`.
    pub fn param(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|k| self.params.get(*k).filter(|v| !v.is_null()))
    }

    /// String parameter; numbers and booleans are rendered.
    pub fn str_param(&self, keys: &[&str]) -> Result<Option<String>> {
        match self.param(keys) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(keys, "expected a string")),
        }
    }

    /// Required string parameter.
    pub fn required_str(&self, keys: &[&str]) -> Result<String> {
        self.str_param(keys)?
            .ok_or_else(|| self.invalid(keys, "missing"))
    }

    /// Boolean parameter with a default.
    pub fn bool_param(&self, keys: &[&str], default: bool) -> Result<bool> {
        match self.param(keys) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(_) => Err(self.invalid(keys, "expected a boolean")),
        }
    }

    /// Non-negative integer parameter.
    pub fn u64_param(&self, keys: &[&str]) -> Result<Option<u64>> {
        match self.param(keys) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .map(Some)
                .ok_or_else(|| self.invalid(keys, "expected a non-negative number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(keys, "expected a non-negative number")),
            Some(_) => Err(self.invalid(keys, "expected a non-negative number")),
        }
    }

    /// Map of string values, e.g. an environment overlay.
    pub fn map_param(&self, keys: &[&str]) -> Result<Vec<(String, String)>> {
        match self.param(keys) {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    Value::Number(n) => Ok((k.clone(), n.to_string())),
                    Value::Bool(b) => Ok((k.clone(), b.to_string())),
                    _ => Err(self.invalid(keys, "values must be strings")),
                })
                .collect(),
            Some(_) => Err(self.invalid(keys, "expected an object")),
        }
    }

    /// Nested step parameter.
    pub fn step_param(&self, keys: &[&str]) -> Result<Step> {
        let value = self
            .param(keys)
            .ok_or_else(|| self.invalid(keys, "missing"))?;
        serde_json::from_value(value.clone()).map_err(|e| self.invalid(keys, &e.to_string()))
    }

    fn invalid(&self, keys: &[&str], reason: &str) -> BenchError {
        BenchError::invalid_param(&self.name, keys.first().copied().unwrap_or_default(), reason)
    }
}
