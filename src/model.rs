//! Core data model shared by the scheduler, the conflict resolver and the collaborators.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of backlog work with acceptance criteria and a pass/fail outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower value means higher priority.
    pub priority: i32,
    /// Persisted truth of completion.
    #[serde(default)]
    pub passes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StoryStatus>,
    #[serde(default)]
    pub notes: String,
    /// Stories that must complete before this one may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Stories that must never run concurrently with this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
    /// Files the story is expected to touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_files: Vec<String>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            passes: false,
            status: None,
            notes: String::new(),
            depends_on: Vec::new(),
            conflicts_with: Vec::new(),
            target_files: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_conflicts(mut self, ids: &[&str]) -> Self {
        self.conflicts_with = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn passing(mut self) -> Self {
        self.passes = true;
        self
    }
}

/// Orders stories by ascending priority, breaking ties by id.
pub fn sort_by_priority(stories: &mut [Story]) {
    stories.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Transient per-run status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl StoryStatus {
    pub fn as_label(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in-progress",
            StoryStatus::Complete => "complete",
            StoryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Project-level build status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BuildStatus::Idle => "idle",
            BuildStatus::Running => "running",
            BuildStatus::Paused => "paused",
        };
        f.write_str(label)
    }
}

/// Output channel a log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
    System,
}

impl LogChannel {
    /// Short prefix used when logs are written to a file.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            LogChannel::Stdout => "[OUT]",
            LogChannel::Stderr => "[ERR]",
            LogChannel::System => "[SYS]",
        }
    }
}

/// One entry of the append-only build log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: LogChannel,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

impl LogEntry {
    pub fn new(channel: LogChannel, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            text: text.into(),
            story_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(LogChannel::System, text)
    }

    pub fn for_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }
}

/// Retry bookkeeping for a single story within one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub retry_count: u32,
    /// Captured logs of each previous attempt, oldest first.
    pub previous_logs: Vec<Vec<LogEntry>>,
}

/// A parallel story whose branch could not be merged automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub story_id: String,
    pub story_title: String,
    pub branch_name: String,
}

/// An isolated working copy held by the scheduler between prepare and finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub path: String,
    pub branch: String,
}
