//! Argument handling and the commands that need neither agents nor git.

use std::fs;

use predicates::prelude::*;

use crate::common::{prd_with, Scratch};

#[test]
fn test_build_help_lists_scheduling_options() {
    Scratch::new()
        .storyloop()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--parallel"))
        .stdout(predicate::str::contains("--max-parallel"))
        .stdout(predicate::str::contains("--from"));
}

#[test]
fn test_parallel_and_sequential_are_exclusive() {
    let scratch = Scratch::new();
    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--parallel", "--sequential"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_zero_max_parallel_is_rejected() {
    let scratch = Scratch::new();
    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--max-parallel", "0"])
        .assert()
        .failure();
}

#[test]
fn test_build_without_backlog_fails() {
    let scratch = Scratch::new();
    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No backlog found"));
}

/// Nothing to do: every story already passes, in either mode.
#[test]
fn test_build_with_all_stories_passing_succeeds() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("PAR-001", true), ("PAR-002", true), ("PAR-003", true)]));

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to build"))
        .stdout(predicate::str::contains("0 complete, 0 failed, 0 blocked, 0 conflicts"));

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--parallel", "--max-parallel", "3"])
        .assert()
        .success();
}

#[test]
fn test_from_unknown_story_fails() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", true)]));

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .args(["--from", "S9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown story: S9"));
}

#[test]
fn test_unknown_agent_fails_before_running() {
    let scratch = Scratch::new();
    scratch.write_prd(&prd_with(&[("S1", false)]));
    fs::write(scratch.repo().join(".ideate").join("config.json"), r#"{"agent": "nobody"}"#).expect("write config");

    scratch
        .storyloop()
        .arg("build")
        .arg(scratch.repo())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown agent 'nobody'"));
}

#[test]
fn test_diff_prints_line_diff() {
    let scratch = Scratch::new();
    let base = scratch.repo().join("base.txt");
    let candidate = scratch.repo().join("candidate.txt");
    fs::write(&base, "a\nb\nc\n").expect("write base");
    fs::write(&candidate, "a\nx\nc\nd\n").expect("write candidate");

    scratch
        .storyloop()
        .arg("diff")
        .arg(&base)
        .arg(&candidate)
        .assert()
        .success()
        .stdout(predicate::str::contains("  a\n- b\n+ x\n  c\n"))
        .stdout(predicate::str::contains("+ d"));
}

#[test]
fn test_diff_missing_file_fails() {
    let scratch = Scratch::new();
    scratch
        .storyloop()
        .arg("diff")
        .arg(scratch.repo().join("nope.txt"))
        .arg(scratch.repo().join("nope2.txt"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}
