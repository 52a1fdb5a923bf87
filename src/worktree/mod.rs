//! Isolated worktrees and merge reconciliation.
//!
//! [`WorktreeManager`] gives each parallel story its own working copy and
//! branch and later folds the branch back into the main line. [`MergeBackend`]
//! drives the manual resolution of branches that could not be merged
//! automatically.

mod git;

use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use git::{sanitize_branch_name, GitWorktrees, WORKTREES_DIR_NAME};

pub use crate::model::Worktree;

/// Errors raised by worktree and merge operations.
#[derive(Error, Debug)]
pub enum WorktreeError {
    /// The branch could not be merged; it has been preserved for manual resolution.
    #[error("Merge conflict, changes kept in branch {branch}: {detail}")]
    MergeConflict { branch: String, detail: String },

    /// Any other failure of a git or filesystem operation.
    #[error("{0}")]
    Operation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which side wins for one conflicting file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Keep the main line's version.
    Ours,
    /// Keep the story branch's version.
    Theirs,
    /// Keep the main line's version followed by the branch's.
    Both,
}

/// A file that conflicts between the main line and a story branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFile {
    pub path: String,
    pub base: String,
    pub ours: String,
    pub theirs: String,
}

/// Result of analysing a branch merge without committing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflictAnalysis {
    pub branch_name: String,
    pub files: Vec<ConflictFile>,
    /// Files changed by the branch that merge cleanly.
    pub clean_count: usize,
}

/// Strategy chosen for one conflicting path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResolution {
    pub path: String,
    pub strategy: ResolutionStrategy,
}

/// Worktree lifecycle collaborator used by the parallel scheduler.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Creates an isolated working copy and branch for a story.
    async fn prepare(&self, repo_path: &Path, story_id: &str) -> Result<Worktree, WorktreeError>;

    /// Merges the branch on success (or discards it on failure) and disposes
    /// of the worktree. A merge that fails reports [`WorktreeError::MergeConflict`]
    /// and keeps the branch.
    async fn finalize(
        &self,
        repo_path: &Path,
        story_id: &str,
        worktree: &Worktree,
        success: bool,
    ) -> Result<(), WorktreeError>;

    /// Removes every worktree and story branch this manager created.
    async fn cleanup_all(&self, repo_path: &Path) -> Result<(), WorktreeError>;
}

/// Merge operations used by the conflict resolver.
#[async_trait]
pub trait MergeBackend: Send + Sync {
    async fn analyze_conflicts(
        &self,
        repo_path: &Path,
        branch_name: &str,
    ) -> Result<MergeConflictAnalysis, WorktreeError>;

    async fn merge_with_resolutions(
        &self,
        repo_path: &Path,
        branch_name: &str,
        resolutions: &[FileResolution],
    ) -> Result<(), WorktreeError>;

    /// Returns the repository to its pre-merge state.
    async fn abort_merge(&self, repo_path: &Path) -> Result<(), WorktreeError>;
}
