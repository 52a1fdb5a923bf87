//! Git CLI implementation of the worktree and merge collaborators.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    ConflictFile, FileResolution, MergeBackend, MergeConflictAnalysis, ResolutionStrategy, Worktree,
    WorktreeError, WorktreeManager,
};

/// Directory, relative to the repository, holding story worktrees.
pub const WORKTREES_DIR_NAME: &str = ".ideate-worktrees";

const BRANCH_PREFIX: &str = "story/";

/// Maps a story id onto something safe for a branch or directory name.
pub fn sanitize_branch_name(story_id: &str) -> String {
    story_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .to_lowercase()
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Worktree manager and merge backend driving the `git` binary.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    git: String,
}

impl GitWorktrees {
    pub fn new() -> Self {
        Self {
            git: "git".to_string(),
        }
    }

    fn worktrees_dir(repo_path: &Path) -> PathBuf {
        repo_path.join(WORKTREES_DIR_NAME)
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, WorktreeError> {
        debug!(dir = %dir.display(), ?args, "git");
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| WorktreeError::Operation(format!("Failed to run git {}: {}", args.join(" "), e)))?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let output = self.run(dir, args).await?;
        if !output.success {
            return Err(WorktreeError::Operation(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Current branch, or the HEAD commit when detached.
    async fn base_ref(&self, repo_path: &Path) -> Result<String, WorktreeError> {
        let branch = self
            .run_checked(repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string();
        if branch != "HEAD" {
            return Ok(branch);
        }
        Ok(self.run_checked(repo_path, &["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn remove_worktree(&self, repo_path: &Path, path: &Path) {
        let path_str = path.to_string_lossy();
        if let Err(err) = self
            .run_checked(repo_path, &["worktree", "remove", "--force", &path_str])
            .await
        {
            debug!(error = %err, "git worktree remove failed, deleting directory");
        }
        if path.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(path).await {
                warn!(path = %path.display(), error = %err, "Failed to delete worktree directory");
            }
        }
        let _ = self.run(repo_path, &["worktree", "prune"]).await;
    }

    async fn unmerged_paths(&self, repo_path: &Path) -> Result<Vec<String>, WorktreeError> {
        let stdout = self
            .run_checked(repo_path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Content of `path` at index stage 1 (base), 2 (ours) or 3 (theirs).
    async fn stage_content(&self, repo_path: &Path, stage: u8, path: &str) -> String {
        let object = format!(":{}:{}", stage, path);
        match self.run(repo_path, &["show", &object]).await {
            Ok(output) if output.success => output.stdout,
            // Missing stage: file added or deleted on one side.
            _ => String::new(),
        }
    }

    async fn start_merge(&self, repo_path: &Path, branch_name: &str) -> Result<GitOutput, WorktreeError> {
        self.run(repo_path, &["merge", "--no-commit", "--no-ff", branch_name]).await
    }
}

impl Default for GitWorktrees {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn prepare(&self, repo_path: &Path, story_id: &str) -> Result<Worktree, WorktreeError> {
        let dir_name = sanitize_branch_name(story_id);
        let branch = format!("{}{}", BRANCH_PREFIX, dir_name);
        let worktrees_dir = Self::worktrees_dir(repo_path);
        let path = worktrees_dir.join(&dir_name);

        tokio::fs::create_dir_all(&worktrees_dir).await?;

        // Leftovers from an interrupted run.
        if path.exists() {
            self.remove_worktree(repo_path, &path).await;
        }
        let _ = self.run(repo_path, &["branch", "-D", &branch]).await;

        let base_ref = self.base_ref(repo_path).await?;
        let path_str = path.to_string_lossy().to_string();
        self.run_checked(repo_path, &["worktree", "add", "-b", &branch, &path_str, &base_ref])
            .await?;

        info!(story_id = %story_id, branch = %branch, "Prepared worktree");
        Ok(Worktree { path: path_str, branch })
    }

    async fn finalize(
        &self,
        repo_path: &Path,
        story_id: &str,
        worktree: &Worktree,
        success: bool,
    ) -> Result<(), WorktreeError> {
        let path = PathBuf::from(&worktree.path);

        if success && path.exists() {
            let status = self.run_checked(&path, &["status", "--porcelain"]).await?;
            if !status.trim().is_empty() {
                self.run_checked(&path, &["add", "-A"]).await?;
                let message = format!("Story {}: Implementation complete", story_id);
                self.run_checked(&path, &["commit", "-m", &message]).await?;
            }

            let base_ref = self.base_ref(repo_path).await?;
            let _ = self.run(repo_path, &["checkout", &base_ref]).await;
            let merge = self.run(repo_path, &["merge", &worktree.branch, "--no-edit"]).await?;
            if !merge.success {
                let _ = self.run(repo_path, &["merge", "--abort"]).await;
                self.remove_worktree(repo_path, &path).await;
                let detail = if merge.stdout.trim().is_empty() {
                    merge.stderr.trim().to_string()
                } else {
                    merge.stdout.trim().to_string()
                };
                return Err(WorktreeError::MergeConflict {
                    branch: worktree.branch.clone(),
                    detail,
                });
            }
        }

        self.remove_worktree(repo_path, &path).await;
        let delete_flag = if success { "-d" } else { "-D" };
        if let Err(err) = self
            .run_checked(repo_path, &["branch", delete_flag, &worktree.branch])
            .await
        {
            warn!(branch = %worktree.branch, error = %err, "Failed to delete story branch");
        }
        Ok(())
    }

    async fn cleanup_all(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        let worktrees_dir = Self::worktrees_dir(repo_path);
        if !worktrees_dir.exists() {
            return Ok(());
        }

        // Branches preserved after a merge conflict no longer have a worktree
        // and are left for manual resolution.
        let listing = self.run_checked(repo_path, &["worktree", "list", "--porcelain"]).await?;
        let mut managed: Vec<(PathBuf, Option<String>)> = Vec::new();
        for line in listing.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                managed.push((PathBuf::from(path), None));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                if let Some(last) = managed.last_mut() {
                    last.1 = Some(branch.to_string());
                }
            }
        }

        for (path, branch) in managed {
            if !path.starts_with(&worktrees_dir) && !path.to_string_lossy().contains(WORKTREES_DIR_NAME) {
                continue;
            }
            self.remove_worktree(repo_path, &path).await;
            if let Some(branch) = branch.filter(|b| b.starts_with(BRANCH_PREFIX)) {
                if let Err(err) = self.run_checked(repo_path, &["branch", "-D", &branch]).await {
                    warn!(branch = %branch, error = %err, "Failed to delete story branch");
                }
            }
        }

        if worktrees_dir.exists() {
            tokio::fs::remove_dir_all(&worktrees_dir).await?;
        }
        info!(repo = %repo_path.display(), "Cleaned up story worktrees");
        Ok(())
    }
}

#[async_trait]
impl MergeBackend for GitWorktrees {
    async fn analyze_conflicts(
        &self,
        repo_path: &Path,
        branch_name: &str,
    ) -> Result<MergeConflictAnalysis, WorktreeError> {
        let merge = self.start_merge(repo_path, branch_name).await?;
        let conflicted = self.unmerged_paths(repo_path).await?;
        if !merge.success && conflicted.is_empty() {
            let _ = self.run(repo_path, &["merge", "--abort"]).await;
            return Err(WorktreeError::Operation(format!(
                "Failed to merge {}: {}",
                branch_name,
                merge.stderr.trim()
            )));
        }

        let mut files = Vec::with_capacity(conflicted.len());
        for path in &conflicted {
            files.push(ConflictFile {
                path: path.clone(),
                base: self.stage_content(repo_path, 1, path).await,
                ours: self.stage_content(repo_path, 2, path).await,
                theirs: self.stage_content(repo_path, 3, path).await,
            });
        }

        let conflicted_set: HashSet<&String> = conflicted.iter().collect();
        let changed = self
            .run(repo_path, &["diff", "--name-only", "HEAD", branch_name])
            .await?
            .stdout;
        let clean_count = changed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !conflicted_set.contains(&line.to_string()))
            .count();

        // Analysis never leaves a merge in progress.
        let _ = self.run(repo_path, &["merge", "--abort"]).await;

        Ok(MergeConflictAnalysis {
            branch_name: branch_name.to_string(),
            files,
            clean_count,
        })
    }

    async fn merge_with_resolutions(
        &self,
        repo_path: &Path,
        branch_name: &str,
        resolutions: &[FileResolution],
    ) -> Result<(), WorktreeError> {
        let merge = self.start_merge(repo_path, branch_name).await?;
        let conflicted = self.unmerged_paths(repo_path).await?;
        if !merge.success && conflicted.is_empty() {
            let _ = self.run(repo_path, &["merge", "--abort"]).await;
            return Err(WorktreeError::Operation(format!(
                "Failed to merge {}: {}",
                branch_name,
                merge.stderr.trim()
            )));
        }

        for resolution in resolutions {
            let path = resolution.path.as_str();
            let applied = match resolution.strategy {
                ResolutionStrategy::Ours => self.run_checked(repo_path, &["checkout", "--ours", "--", path]).await.map(|_| ()),
                ResolutionStrategy::Theirs => self.run_checked(repo_path, &["checkout", "--theirs", "--", path]).await.map(|_| ()),
                ResolutionStrategy::Both => {
                    let ours = self.stage_content(repo_path, 2, path).await;
                    let theirs = self.stage_content(repo_path, 3, path).await;
                    let mut combined = ours;
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&theirs);
                    tokio::fs::write(repo_path.join(path), combined).await.map_err(WorktreeError::from)
                }
            };
            if let Err(err) = applied {
                let _ = self.run(repo_path, &["merge", "--abort"]).await;
                return Err(err);
            }
            if let Err(err) = self.run_checked(repo_path, &["add", "--", path]).await {
                let _ = self.run(repo_path, &["merge", "--abort"]).await;
                return Err(err);
            }
        }

        let remaining = self.unmerged_paths(repo_path).await?;
        if !remaining.is_empty() {
            let _ = self.run(repo_path, &["merge", "--abort"]).await;
            return Err(WorktreeError::Operation(format!(
                "Unresolved paths remain: {}",
                remaining.join(", ")
            )));
        }

        let message = format!("Merge {} with manual conflict resolution", branch_name);
        if let Err(err) = self.run_checked(repo_path, &["commit", "-m", &message]).await {
            let _ = self.run(repo_path, &["merge", "--abort"]).await;
            return Err(err);
        }
        if let Err(err) = self.run_checked(repo_path, &["branch", "-D", branch_name]).await {
            warn!(branch = %branch_name, error = %err, "Merged but failed to delete branch");
        }
        info!(branch = %branch_name, files = resolutions.len(), "Merged branch with resolutions");
        Ok(())
    }

    async fn abort_merge(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        let in_merge = self
            .run(repo_path, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .await?
            .success;
        if in_merge {
            self.run_checked(repo_path, &["merge", "--abort"]).await?;
        }
        Ok(())
    }
}
