//! Placeholder substitution in step parameters.
//!
//! Placeholders are plain `$NAME` tokens replaced by literal substring
//! replacement, in a fixed order so that a placeholder never clobbers a
//! longer one sharing its prefix (`$PACKAGES_DIR` before `$PACKAGE_DIR`,
//! `$RESULTS_DIR` before `$RESULT_DIR`). Unknown placeholders are left alone.

use crate::context::RunContext;
use benchman_core::{Step, Task};
use serde_json::Value;

/// Parameter holding a nested step; interpolated when that step is dispatched.
const NESTED_STEP_KEY: &str = "execute";

/// Resolved placeholder values for one task.
#[derive(Debug, Clone)]
pub struct Vars {
    pairs: Vec<(&'static str, String)>,
}

impl Vars {
    /// Placeholder values of `task` within `ctx`.
    pub fn for_task(ctx: &RunContext, task: &Task) -> Self {
        let config = &ctx.config;
        let layout = &ctx.layout;
        let path = |p: &std::path::Path| p.display().to_string();

        let mut pairs = vec![
            ("$PACKAGES_DIR", path(layout.packages_root())),
            ("$PACKAGE_NAME", task.canonical_name()),
            ("$TASK_TMP_DIR", path(&layout.label_scratch(&ctx.label))),
            ("$TARGET_TMP_DIR", path(&ctx.scratch_dir(task))),
            ("$TARGET", path(&layout.package_dir(task))),
            ("$PACKAGE_DIR", path(&layout.package_version_dir(task))),
            ("$PACKAGE_VERSION", task.canonical_version()),
            ("$TASK_LABEL", ctx.label.clone()),
            ("$TASK_NAME", ctx.task_name.clone()),
            ("$BENCHMARK_DIR", path(&config.project_dir)),
            ("$RESULTS_DIR", path(&layout.label_results(&ctx.label))),
            ("$RESULT_DIR", path(&ctx.result_dir(task))),
            ("$SCRIPT_DIR", path(&config.project_dir)),
            ("$ANALYZER_PATH", path(&config.analyzer_path)),
            ("$MAX_MEMORY_MB", config.memory_mb().to_string()),
            ("$CPUS", config.cpus_per_process.to_string()),
            ("$CODE_QL_HOME", path(&config.codeql_home)),
        ];
        if let Some(dir) = &ctx.dynamic_dir {
            pairs.push(("$DYNAMIC_DIR", path(dir)));
        }
        Self { pairs }
    }

    /// Value of a placeholder.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replace every known placeholder in `s`.
    pub fn apply(&self, s: &str) -> String {
        let mut out = s.to_string();
        for (key, value) in &self.pairs {
            if out.contains(key) {
                out = out.replace(key, value);
            }
        }
        out
    }

    /// Interpolate every string inside `value`.
    pub fn apply_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.apply(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.apply_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.apply_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Copy of `step` with its parameters interpolated.
    ///
    /// A nested step is left untouched; it is interpolated when dispatched.
    pub fn apply_step(&self, step: &Step) -> Step {
        let params = step
            .params
            .iter()
            .map(|(k, v)| {
                let v = if k == NESTED_STEP_KEY { v.clone() } else { self.apply_value(v) };
                (k.clone(), v)
            })
            .collect();
        Step {
            name: step.name.clone(),
            params,
        }
    }
}
