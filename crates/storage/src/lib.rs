//! Filesystem storage for benchman.
//!
//! Everything the runner persists lives in three trees: the package cache,
//! the results tree and the scratch tree. This crate knows how those trees
//! are laid out, reads and writes task databases, and manages the finish
//! markers used to resume interrupted runs.

#![warn(missing_docs)]

pub mod layout;
pub mod markers;
pub mod task_db;

pub use layout::{Layout, ResultEntry};
pub use markers::{FinishMarker, MarkerDir};
pub use task_db::{read_task_list, read_tasks, write_tasks};
