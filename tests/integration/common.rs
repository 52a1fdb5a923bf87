//! Scratch repositories, fake agents and a binary handle.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// A temp dir holding a repository, its backlog and an isolated config dir.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("repo")).expect("mkdir repo");
        Self { dir }
    }

    pub fn repo(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    fn config_home(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    pub fn prd_path(&self) -> PathBuf {
        self.repo().join(".ideate").join("prd.json")
    }

    pub fn write_prd(&self, json: &str) {
        let path = self.prd_path();
        fs::create_dir_all(path.parent().expect("prd dir")).expect("mkdir .ideate");
        fs::write(path, json).expect("Failed to write test PRD");
    }

    pub fn prd(&self) -> Value {
        serde_json::from_str(&fs::read_to_string(self.prd_path()).expect("read prd")).expect("parse prd")
    }

    pub fn story_passes(&self, story_id: &str) -> bool {
        self.prd()["userStories"]
            .as_array()
            .expect("userStories")
            .iter()
            .any(|s| s["id"] == story_id && s["passes"] == true)
    }

    /// Points the `claude-code` agent at `executable` through the user preferences.
    pub fn use_agent(&self, executable: &Path) {
        let dir = self.config_home().join("storyloop");
        fs::create_dir_all(&dir).expect("mkdir config");
        let prefs = format!("[agent_paths]\nclaude-code = \"{}\"\n", executable.display());
        fs::write(dir.join("preferences.toml"), prefs).expect("write preferences");
    }

    /// Installs a shell script as the agent.
    #[cfg(unix)]
    pub fn install_agent(&self, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join("agent.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write agent");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod agent");
        self.use_agent(&path);
        path
    }

    /// The binary with user config and home redirected into the scratch dir.
    #[allow(deprecated)]
    pub fn storyloop(&self) -> Command {
        let mut cmd = Command::cargo_bin("storyloop").expect("Failed to find storyloop binary");
        cmd.env("HOME", self.dir.path())
            .env("XDG_CONFIG_HOME", self.config_home())
            .env_remove("RUST_LOG")
            .timeout(std::time::Duration::from_secs(30));
        cmd
    }
}

/// Backlog with the given `(id, passes)` stories, in priority order.
pub fn prd_with(stories: &[(&str, bool)]) -> String {
    let stories: Vec<Value> = stories
        .iter()
        .enumerate()
        .map(|(i, (id, passes))| {
            serde_json::json!({
                "id": id,
                "title": format!("Story {}", id),
                "description": "Integration test story",
                "acceptanceCriteria": ["It works"],
                "priority": i + 1,
                "passes": passes,
            })
        })
        .collect();
    serde_json::json!({ "project": "Scratch", "userStories": stories }).to_string()
}

pub fn git_available() -> bool {
    StdCommand::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn git(repo: &Path, args: &[&str]) -> String {
    let out = StdCommand::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// Initialises a repository with one commit and a local identity.
pub fn init_repo(repo: &Path) {
    git(repo, &["init", "-q"]);
    git(repo, &["config", "user.email", "dev@example.com"]);
    git(repo, &["config", "user.name", "Dev"]);
    git(repo, &["config", "commit.gpgsign", "false"]);
    fs::write(repo.join("README.md"), "# scratch\n").expect("write readme");
    fs::write(repo.join(".gitignore"), ".ideate/\n.ideate-worktrees/\n").expect("write gitignore");
    git(repo, &["add", "README.md", ".gitignore"]);
    git(repo, &["commit", "-q", "-m", "initial"]);
}
