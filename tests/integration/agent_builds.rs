//! Builds that run a real agent process (a shell script standing in for one).

#![cfg(unix)]

use std::fs;

use predicates::prelude::*;
use serde_json::Value;

use crate::common::{prd_with, Scratch};

#[test]
fn test_sequential_build_runs_agent_and_records_passes() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", false), ("S2", false), ("S0", true)]));
    scratch.install_agent("echo \"agent saw $1\"\necho \"$2\" | head -n 1 >> stories.log");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .arg("--sequential")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent saw -p"))
        .stdout(predicate::str::contains("2 complete, 0 failed, 0 blocked, 0 conflicts"));

    assert!(scratch.story_passes("S1"));
    assert!(scratch.story_passes("S2"));
    let log = fs::read_to_string(scratch.repo().join("stories.log")).expect("agent ran in repo");
    assert_eq!(log, "# Story S1: Story S1\n# Story S2: Story S2\n");
}

#[test]
fn test_from_reruns_passing_story() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", true), ("S2", true), ("S3", false)]));
    scratch.install_agent("echo \"$2\" | head -n 1 >> stories.log");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--from", "S2"])
        .assert()
        .success();

    let log = fs::read_to_string(scratch.repo().join("stories.log")).expect("agent ran");
    assert_eq!(log, "# Story S2: Story S2\n# Story S3: Story S3\n");
}

#[test]
fn test_history_records_each_attempt() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", false)]));
    scratch.install_agent("echo working\necho oops >&2");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--history", "--project-id", "scratch"])
        .assert()
        .success();

    let ideate = scratch.repo().join(".ideate");
    let history: Value =
        serde_json::from_str(&fs::read_to_string(ideate.join("process-history.json")).expect("history"))
            .expect("parse history");
    let entries = history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["projectId"], "scratch");
    assert_eq!(entries[0]["label"], "S1");
    assert_eq!(entries[0]["success"], true);

    let log_path = entries[0]["logFilePath"].as_str().expect("log path");
    let log = fs::read_to_string(log_path).expect("log file");
    assert!(log.contains("[OUT] working"), "{}", log);
    assert!(log.contains("[ERR] oops"), "{}", log);
}

#[test]
fn test_quit_key_cancels_and_kills_agent() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", false), ("S2", false)]));
    scratch.install_agent("sleep 30");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .write_stdin("q\n")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .code(130)
        .stdout(predicate::str::contains("Build cancelled"));

    assert!(!scratch.story_passes("S1"));
}

/// Parallel stories need worktrees; outside a git repository every story fails
/// and the build reports it instead of hanging.
#[test]
fn test_parallel_build_outside_git_fails_every_story() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", false), ("S2", false)]));
    scratch.install_agent("exit 0");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--parallel", "--max-parallel", "2"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("0 complete, 2 failed"));

    assert!(!scratch.story_passes("S1"));
}
