//! Execution layer - pipeline engine, source preparation and batch scheduling.

#![warn(missing_docs)]

pub mod condition;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod operations;
pub mod scheduler;
pub mod source;
pub mod vars;

pub use condition::Condition;
pub use context::RunContext;
pub use discovery::{discover, Discovered};
pub use engine::{PipelineEngine, TaskOutcome};
pub use operations::{Operation, StepRunner};
pub use scheduler::{BatchScheduler, Parallelism};
pub use source::{Fetcher, Installer, NpmInstaller, PackageFetcher, PackageManager, SourcePreparer};
pub use vars::Vars;
