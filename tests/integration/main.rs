//! End-to-end tests for the storyloop binary and library.

mod agent_builds;
mod cli;
mod common;
mod git_worktrees;
