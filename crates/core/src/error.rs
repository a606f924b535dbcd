//! Error taxonomy shared by every benchman crate.

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors raised while preparing, running or comparing benchmark tasks.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Package source could not be downloaded
    #[error("fetch failed for {task}: {reason}")]
    Fetch {
        /// Task display string
        task: String,
        /// What went wrong
        reason: String,
    },

    /// Dependencies could not be installed, fallback included
    #[error("install failed for {task}: {reason}")]
    Install {
        /// Task display string
        task: String,
        /// What went wrong
        reason: String,
    },

    /// External tool exited abnormally or could not be started
    #[error("tool invocation failed: {command} (exit code {exit_code})")]
    ToolInvocation {
        /// Command line that was executed
        command: String,
        /// Exit code, `-1` for timeouts and forced kills
        exit_code: i32,
    },

    /// Container runtime unavailable, image missing, ...
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Pipeline descriptor, task database or project file could not be parsed
    #[error("malformed descriptor {path}: {reason}")]
    MalformedDescriptor {
        /// File or logical source that failed to parse
        path: String,
        /// Parser message
        reason: String,
    },

    /// An artifact a comparison step depends on does not exist
    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    /// Step name not present in the operation registry
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Step parameter missing or of the wrong type
    #[error("invalid parameter `{name}` for {operation}: {reason}")]
    InvalidParam {
        /// Operation name
        operation: String,
        /// Parameter name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// A batch worker panicked or was cancelled
    #[error("worker failed: {0}")]
    Worker(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Build a [`BenchError::MalformedDescriptor`].
    pub fn malformed(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BenchError::MalformedDescriptor {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a [`BenchError::InvalidParam`].
    pub fn invalid_param(
        operation: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        BenchError::InvalidParam {
            operation: operation.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }
}
