//! Manual resolution of story branches that failed to merge.
//!
//! A [`ConflictSession`] walks one branch through
//! `scanning -> mergeable | needs-resolution -> merging -> merged | aborted`.

pub mod diff;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{BuildError, BuildResult};
use crate::model::ConflictInfo;
use crate::worktree::{ConflictFile, FileResolution, MergeBackend, ResolutionStrategy};

pub use diff::{diff_lines, render, DiffKind, DiffLine};

/// Strategy every conflicting file starts with: keep the story branch's changes.
pub const DEFAULT_STRATEGY: ResolutionStrategy = ResolutionStrategy::Theirs;

/// Phase of a conflict session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPhase {
    Scanning,
    /// Nothing conflicts; the branch can be merged as is.
    Mergeable,
    NeedsResolution,
    Merging,
    Merged,
    Aborted,
}

impl ConflictPhase {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConflictPhase::Scanning => "scanning",
            ConflictPhase::Mergeable => "mergeable",
            ConflictPhase::NeedsResolution => "needs-resolution",
            ConflictPhase::Merging => "merging",
            ConflictPhase::Merged => "merged",
            ConflictPhase::Aborted => "aborted",
        }
    }

    fn accepts_submission(&self) -> bool {
        matches!(self, ConflictPhase::Mergeable | ConflictPhase::NeedsResolution)
    }
}

impl fmt::Display for ConflictPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Both sides of a conflicting file rendered against the merge base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiffs {
    pub ours: Vec<DiffLine>,
    pub theirs: Vec<DiffLine>,
}

/// Interactive resolution of one branch.
pub struct ConflictSession {
    backend: Arc<dyn MergeBackend>,
    repo_path: PathBuf,
    branch_name: String,
    story_id: Option<String>,
    phase: ConflictPhase,
    files: Vec<ConflictFile>,
    clean_count: usize,
    strategies: BTreeMap<String, ResolutionStrategy>,
}

impl fmt::Debug for ConflictSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictSession")
            .field("repo_path", &self.repo_path)
            .field("branch_name", &self.branch_name)
            .field("story_id", &self.story_id)
            .field("phase", &self.phase)
            .field("files", &self.files.len())
            .finish()
    }
}

impl ConflictSession {
    /// Creates a session in the `scanning` phase. Call [`scan`](Self::scan) next.
    pub fn new(backend: Arc<dyn MergeBackend>, repo_path: impl Into<PathBuf>, branch_name: impl Into<String>) -> Self {
        Self {
            backend,
            repo_path: repo_path.into(),
            branch_name: branch_name.into(),
            story_id: None,
            phase: ConflictPhase::Scanning,
            files: Vec::new(),
            clean_count: 0,
            strategies: BTreeMap::new(),
        }
    }

    /// Creates and scans a session for a recorded conflict.
    pub async fn for_conflict(
        backend: Arc<dyn MergeBackend>,
        repo_path: impl Into<PathBuf>,
        conflict: &ConflictInfo,
    ) -> BuildResult<Self> {
        let mut session = Self::new(backend, repo_path, conflict.branch_name.clone());
        session.story_id = Some(conflict.story_id.clone());
        session.scan().await?;
        Ok(session)
    }

    /// Creates and scans a session for an arbitrary branch.
    pub async fn open(
        backend: Arc<dyn MergeBackend>,
        repo_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
    ) -> BuildResult<Self> {
        let mut session = Self::new(backend, repo_path, branch_name);
        session.scan().await?;
        Ok(session)
    }

    /// Analyses the branch and moves to `mergeable` or `needs-resolution`.
    pub async fn scan(&mut self) -> BuildResult<()> {
        self.require(ConflictPhase::Scanning, "scan")?;
        let analysis = self
            .backend
            .analyze_conflicts(&self.repo_path, &self.branch_name)
            .await?;

        self.strategies = analysis
            .files
            .iter()
            .map(|file| (file.path.clone(), DEFAULT_STRATEGY))
            .collect();
        self.clean_count = analysis.clean_count;
        self.files = analysis.files;
        self.phase = if self.files.is_empty() {
            ConflictPhase::Mergeable
        } else {
            ConflictPhase::NeedsResolution
        };
        info!(
            branch = %self.branch_name,
            conflicts = self.files.len(),
            clean = self.clean_count,
            phase = %self.phase,
            "Analysed branch"
        );
        Ok(())
    }

    pub fn phase(&self) -> ConflictPhase {
        self.phase
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    /// Story whose conflict this session resolves, when opened from the registry.
    pub fn story_id(&self) -> Option<&str> {
        self.story_id.as_deref()
    }

    pub fn files(&self) -> &[ConflictFile] {
        &self.files
    }

    /// Number of changed files that merge without intervention.
    pub fn clean_count(&self) -> usize {
        self.clean_count
    }

    pub fn strategy(&self, path: &str) -> Option<ResolutionStrategy> {
        self.strategies.get(path).copied()
    }

    pub fn set_strategy(&mut self, path: &str, strategy: ResolutionStrategy) -> BuildResult<()> {
        self.require(ConflictPhase::NeedsResolution, "change strategies")?;
        self.file(path)?;
        self.strategies.insert(path.to_string(), strategy);
        Ok(())
    }

    /// Leaves `path` without a strategy; the merge cannot be submitted until one is set.
    pub fn clear_strategy(&mut self, path: &str) -> BuildResult<()> {
        self.require(ConflictPhase::NeedsResolution, "change strategies")?;
        self.file(path)?;
        self.strategies.remove(path);
        Ok(())
    }

    /// Conflicting files that have no strategy, in path order.
    pub fn unresolved_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .iter()
            .filter(|file| !self.strategies.contains_key(&file.path))
            .map(|file| file.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Base-vs-ours and base-vs-theirs diffs for one conflicting file.
    pub fn file_diffs(&self, path: &str) -> BuildResult<FileDiffs> {
        let file = self.file(path)?;
        Ok(FileDiffs {
            ours: diff_lines(&file.base, &file.ours),
            theirs: diff_lines(&file.base, &file.theirs),
        })
    }

    /// Merges the branch with the chosen strategies.
    ///
    /// Rejected without touching the repository while any conflicting file has
    /// no strategy. A failed merge is aborted and ends the session.
    pub async fn submit(&mut self) -> BuildResult<()> {
        if !self.phase.accepts_submission() {
            return Err(self.not_ready("submit"));
        }
        let unresolved = self.unresolved_paths();
        if !unresolved.is_empty() {
            return Err(BuildError::UnresolvedFiles { paths: unresolved });
        }

        let resolutions: Vec<FileResolution> = self
            .strategies
            .iter()
            .map(|(path, strategy)| FileResolution {
                path: path.clone(),
                strategy: *strategy,
            })
            .collect();

        self.phase = ConflictPhase::Merging;
        match self
            .backend
            .merge_with_resolutions(&self.repo_path, &self.branch_name, &resolutions)
            .await
        {
            Ok(()) => {
                self.phase = ConflictPhase::Merged;
                info!(branch = %self.branch_name, files = resolutions.len(), "Conflict resolved and merged");
                Ok(())
            }
            Err(err) => {
                warn!(branch = %self.branch_name, error = %err, "Merge with resolutions failed, aborting");
                if let Err(abort_err) = self.backend.abort_merge(&self.repo_path).await {
                    warn!(error = %abort_err, "Failed to abort merge");
                }
                self.phase = ConflictPhase::Aborted;
                Err(err.into())
            }
        }
    }

    /// Abandons the merge and restores the repository. Only valid before submission.
    pub async fn abort(&mut self) -> BuildResult<()> {
        if !matches!(
            self.phase,
            ConflictPhase::Scanning | ConflictPhase::Mergeable | ConflictPhase::NeedsResolution
        ) {
            return Err(self.not_ready("abort"));
        }
        self.backend.abort_merge(&self.repo_path).await?;
        self.phase = ConflictPhase::Aborted;
        info!(branch = %self.branch_name, "Conflict resolution aborted");
        Ok(())
    }

    fn file(&self, path: &str) -> BuildResult<&ConflictFile> {
        self.files
            .iter()
            .find(|file| file.path == path)
            .ok_or_else(|| BuildError::UnknownConflictFile(path.to_string()))
    }

    fn require(&self, phase: ConflictPhase, action: &'static str) -> BuildResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(self.not_ready(action))
        }
    }

    fn not_ready(&self, action: &'static str) -> BuildError {
        BuildError::NotReady {
            phase: self.phase.as_label(),
            action,
        }
    }
}
