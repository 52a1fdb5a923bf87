//! Worktree isolation and conflict resolution against real git repositories.
//!
//! Skipped when no `git` executable is available.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use predicates::prelude::*;
use storyloop::worktree::{
    GitWorktrees, MergeBackend, ResolutionStrategy, WorktreeError, WorktreeManager, WORKTREES_DIR_NAME,
};
use storyloop::{ConflictPhase, ConflictSession};

use crate::common::{git, git_available, init_repo, prd_with, Scratch};

fn story_branches(repo: &Path) -> Vec<String> {
    git(repo, &["branch", "--format=%(refname:short)", "--list", "story/*"])
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[tokio::test]
async fn test_worktree_lifecycle_merges_story_work() {
    if !git_available() {
        return;
    }
    let scratch = Scratch::new();
    let repo = scratch.repo();
    init_repo(&repo);
    let worktrees = GitWorktrees::new();

    let worktree = worktrees.prepare(&repo, "US-001").await.expect("prepare");
    assert_eq!(worktree.branch, "story/us-001");
    assert!(Path::new(&worktree.path).starts_with(repo.join(WORKTREES_DIR_NAME)));
    fs::write(Path::new(&worktree.path).join("feature.txt"), "done\n").expect("write feature");

    worktrees.finalize(&repo, "US-001", &worktree, true).await.expect("finalize");

    assert_eq!(fs::read_to_string(repo.join("feature.txt")).expect("merged"), "done\n");
    assert!(!Path::new(&worktree.path).exists());
    assert!(story_branches(&repo).is_empty());
    assert!(git(&repo, &["log", "--oneline"]).contains("Story US-001: Implementation complete"));
}

#[tokio::test]
async fn test_failed_story_is_discarded() {
    if !git_available() {
        return;
    }
    let scratch = Scratch::new();
    let repo = scratch.repo();
    init_repo(&repo);
    let worktrees = GitWorktrees::new();

    let worktree = worktrees.prepare(&repo, "US-002").await.expect("prepare");
    fs::write(Path::new(&worktree.path).join("half.txt"), "wip\n").expect("write");
    worktrees.finalize(&repo, "US-002", &worktree, false).await.expect("finalize");

    assert!(!repo.join("half.txt").exists());
    assert!(story_branches(&repo).is_empty());
}

#[tokio::test]
async fn test_conflicting_finalize_preserves_branch_and_cleanup_keeps_it() {
    if !git_available() {
        return;
    }
    let scratch = Scratch::new();
    let repo = scratch.repo();
    init_repo(&repo);
    let worktrees = GitWorktrees::new();

    let first = worktrees.prepare(&repo, "A").await.expect("prepare a");
    let second = worktrees.prepare(&repo, "B").await.expect("prepare b");
    let open = worktrees.prepare(&repo, "C").await.expect("prepare c");
    fs::write(Path::new(&first.path).join("shared.txt"), "from a\n").expect("write a");
    fs::write(Path::new(&second.path).join("shared.txt"), "from b\n").expect("write b");

    worktrees.finalize(&repo, "A", &first, true).await.expect("finalize a");
    let err = worktrees.finalize(&repo, "B", &second, true).await.unwrap_err();
    assert!(matches!(err, WorktreeError::MergeConflict { ref branch, .. } if branch == "story/b"));
    assert!(git(&repo, &["status", "--porcelain"]).trim().is_empty(), "merge was aborted");

    worktrees.cleanup_all(&repo).await.expect("cleanup");
    assert!(!Path::new(&open.path).exists());
    assert!(!repo.join(WORKTREES_DIR_NAME).exists());
    assert_eq!(story_branches(&repo), vec!["story/b".to_string()]);

    let backend: Arc<dyn MergeBackend> = Arc::new(GitWorktrees::new());
    let mut session = ConflictSession::open(backend, &repo, "story/b").await.expect("session");
    assert_eq!(session.phase(), ConflictPhase::NeedsResolution);
    assert_eq!(session.files().len(), 1);
    assert_eq!(session.files()[0].ours, "from a\n");
    assert_eq!(session.files()[0].theirs, "from b\n");
    assert!(git(&repo, &["status", "--porcelain"]).trim().is_empty(), "analysis leaves no merge behind");

    session.set_strategy("shared.txt", ResolutionStrategy::Both).expect("strategy");
    session.submit().await.expect("submit");
    assert_eq!(session.phase(), ConflictPhase::Merged);
    assert_eq!(fs::read_to_string(repo.join("shared.txt")).expect("merged"), "from a\nfrom b\n");
    assert!(story_branches(&repo).is_empty());
}

#[test]
fn test_parallel_build_merges_independent_stories() {
    if !git_available() {
        return;
    }
    let scratch = Scratch::new();
    let repo = scratch.repo();
    init_repo(&repo);
    scratch.write_prd(&prd_with(&[("S1", false), ("S2", false), ("S3", false)]));
    scratch.install_agent("echo \"$2\" | head -n 1 > \"story-$$.txt\"");

    scratch
        .storyloop()
        .arg("build")
        .arg(&repo)
        .args(["--parallel", "--max-parallel", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 complete, 0 failed, 0 blocked, 0 conflicts"));

    for id in ["S1", "S2", "S3"] {
        assert!(scratch.story_passes(id), "{} should pass", id);
    }
    let merged = fs::read_dir(&repo)
        .expect("read repo")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("story-"))
        .count();
    assert_eq!(merged, 3);
    assert!(story_branches(&repo).is_empty());
    let leftovers = fs::read_dir(repo.join(WORKTREES_DIR_NAME))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn test_conflicting_parallel_stories_resolved_from_cli() {
    if !git_available() {
        return;
    }
    let scratch = Scratch::new();
    let repo = scratch.repo();
    init_repo(&repo);
    scratch.write_prd(&prd_with(&[("alpha", false), ("beta", false)]));
    // Both stories write the same new file; the sleep keeps both worktrees
    // based on the same commit.
    scratch.install_agent("sleep 1\necho \"$2\" | head -n 1 > shared.txt");

    scratch
        .storyloop()
        .arg("build")
        .arg(&repo)
        .args(["--parallel", "--max-parallel", "2"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 complete, 1 failed, 0 blocked, 1 conflicts"));

    let branches = story_branches(&repo);
    assert_eq!(branches.len(), 1, "{:?}", branches);
    let branch = &branches[0];

    scratch
        .storyloop()
        .arg("conflicts")
        .arg(&repo)
        .arg(branch)
        .arg("--show")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 conflicting, 0 clean"))
        .stdout(predicate::str::contains("shared.txt"))
        .stdout(predicate::str::contains("repository unchanged"));
    assert_eq!(story_branches(&repo), branches);

    scratch
        .storyloop()
        .arg("conflicts")
        .arg(&repo)
        .arg(branch)
        .assert()
        .success()
        .stdout(predicate::str::contains("Merged"));

    assert!(story_branches(&repo).is_empty());
    let winner = if branch == "story/alpha" { "Story alpha" } else { "Story beta" };
    let merged = fs::read_to_string(repo.join("shared.txt")).expect("shared");
    assert!(merged.contains(winner), "theirs wins by default: {}", merged);
}
