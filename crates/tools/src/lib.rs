//! Tool Integration
//!
//! Run external tools as supervised processes, optionally inside a container
//! sandbox, and manage the scratch directories they work in.

#![warn(missing_docs)]

pub mod process;
pub mod runner;
pub mod sandbox;
pub mod workspace;

pub use process::{kill_tree, TreeGuard};
pub use runner::{
    CommandExecutor, CommandOutcome, CommandRunner, CommandSpec, ABNORMAL_EXIT,
    DEFAULT_OUTPUT_LINES,
};
pub use sandbox::{container_name, DockerSandbox, SandboxLimits, SandboxRun, PACKAGE_MOUNT};
pub use workspace::ScopedWorkspace;
