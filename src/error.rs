//! Error taxonomy for build orchestration.

use std::io;

use thiserror::Error;

use crate::backlog::BacklogError;
use crate::config::ConfigError;
use crate::model::BuildStatus;
use crate::runner::RunnerError;
use crate::worktree::WorktreeError;

/// Errors surfaced by the build coordinator and the conflict resolver.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The agent process could not be started.
    #[error("Failed to spawn agent process '{executable}': {reason}")]
    ProcessSpawn { executable: String, reason: String },

    /// The agent ran but exited unsuccessfully.
    #[error("Agent for story {story_id} failed ({})", describe_exit(.exit_code))]
    AgentExecutionFailure {
        story_id: String,
        exit_code: Option<i32>,
    },

    /// Finalizing a worktree hit a merge conflict; the branch was preserved.
    #[error("Merge conflict, changes kept in branch {branch}")]
    MergeConflict { branch: String },

    /// Waiting on or killing an agent process failed.
    #[error("Agent runner error: {0}")]
    Runner(String),

    /// Creating, finalizing or cleaning up a worktree failed.
    #[error("Worktree operation failed: {0}")]
    WorktreeOperation(String),

    /// A story never became ready because its prerequisites did not complete.
    #[error("Story {story_id} is blocked by unsatisfied dependencies: {}", .missing.join(", "))]
    DependencyUnsatisfied {
        story_id: String,
        missing: Vec<String>,
    },

    /// A command was issued in a state where it is not meaningful.
    #[error("Cannot {command} while the build is {status}")]
    InvalidTransition {
        command: &'static str,
        status: BuildStatus,
    },

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Unknown story: {0}")]
    UnknownStory(String),

    #[error("No conflict recorded for story {0}")]
    UnknownConflict(String),

    #[error("{0} is not a conflicting file of this merge")]
    UnknownConflictFile(String),

    /// A merge was submitted while some conflicting files had no strategy.
    #[error("{} conflicting file(s) have no resolution strategy: {}", .paths.len(), .paths.join(", "))]
    UnresolvedFiles { paths: Vec<String> },

    /// A conflict session operation was attempted in the wrong phase.
    #[error("Conflict session is {phase}, cannot {action}")]
    NotReady {
        phase: &'static str,
        action: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backlog(#[from] BacklogError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated without exit code".to_string(),
    }
}

impl From<RunnerError> for BuildError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Spawn { executable, source } => BuildError::ProcessSpawn {
                executable,
                reason: source.to_string(),
            },
            other => BuildError::Runner(other.to_string()),
        }
    }
}

impl From<WorktreeError> for BuildError {
    fn from(err: WorktreeError) -> Self {
        match err {
            WorktreeError::MergeConflict { branch, .. } => BuildError::MergeConflict { branch },
            other => BuildError::WorktreeOperation(other.to_string()),
        }
    }
}

/// Result type for build orchestration.
pub type BuildResult<T> = Result<T, BuildError>;
