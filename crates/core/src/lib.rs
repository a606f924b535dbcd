//! Benchman core data models.
//!
//! This crate defines the task identity model, the runner configuration,
//! the pipeline descriptor and the error taxonomy shared by every other
//! benchman crate.

#![warn(missing_docs)]

mod config;
mod error;
mod pipeline;
mod task;

// Re-exports
pub use config::{parse_memory_mb, Config, ConfigOverrides, CODE_QL_HOME_ENV, LOCAL_SETTINGS_FILE};
pub use error::{BenchError, Result};
pub use pipeline::{PipelineDescriptor, PipelineSettings, Step, DEFAULT_TASK_NAME};
pub use task::{SubTask, Task, SUB_DELIMITER, SUB_NAME_MAX, SUB_VERSION_MAX};
