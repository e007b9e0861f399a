//! Error taxonomy for the coordination engine.
//!
//! Failures that indicate a race with another legitimate actor
//! (`ClaimConflict`, `WorktreeExists`) are expected and handled close to
//! where they occur. Resource-unavailability failures (`LockTimeout`,
//! `PluginTimeout`) surface to the invoking workflow step, which decides
//! whether to abort or retry.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = WeftError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WeftError {
    /// Another actor claimed the task first. Never retried internally.
    #[error("task {task_id} is already claimed (holder: {holder})")]
    ClaimConflict { task_id: String, holder: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The merge lock could not be obtained within the caller's budget.
    #[error("timed out after {waited_secs}s waiting for merge lock (held by {holder})")]
    LockTimeout { waited_secs: u64, holder: String },

    /// A blocking plugin exited non-zero. Gates the triggering workflow.
    #[error("blocking plugin '{name}' failed with exit code {code}")]
    PluginFailure { name: String, code: i32 },

    /// A blocking plugin overran its timeout and was killed. Treated
    /// identically to a non-zero exit by callers.
    #[error("blocking plugin '{name}' timed out after {timeout_secs}s")]
    PluginTimeout { name: String, timeout_secs: u64 },

    #[error("worktree for task {task_id} already exists at {}", path.display())]
    WorktreeExists { task_id: String, path: PathBuf },

    #[error("no worktree found for task {0}")]
    WorktreeMissing(String),

    /// The external task store did not answer (missing binary, timeout,
    /// malformed output). The core does not retry these.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WeftError {
    /// Reserved process exit codes so shell callers can branch on the
    /// failure kind. 0 = success, 1 = any other error.
    pub fn exit_code(&self) -> i32 {
        match self {
            WeftError::ClaimConflict { .. } => 10,
            WeftError::LockTimeout { .. } => 11,
            WeftError::PluginFailure { .. } | WeftError::PluginTimeout { .. } => 12,
            WeftError::WorktreeExists { .. } | WeftError::WorktreeMissing(_) => 13,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_reserved_per_kind() {
        let conflict = WeftError::ClaimConflict {
            task_id: "t-1".into(),
            holder: "agent-a".into(),
        };
        assert_eq!(conflict.exit_code(), 10);

        let timeout = WeftError::LockTimeout {
            waited_secs: 300,
            holder: "t-2".into(),
        };
        assert_eq!(timeout.exit_code(), 11);

        let plugin = WeftError::PluginFailure {
            name: "ci-gate".into(),
            code: 2,
        };
        let plugin_timeout = WeftError::PluginTimeout {
            name: "ci-gate".into(),
            timeout_secs: 30,
        };
        assert_eq!(plugin.exit_code(), plugin_timeout.exit_code());

        let generic = WeftError::Config("bad".into());
        assert_eq!(generic.exit_code(), 1);
    }
}
