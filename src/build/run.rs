//! One build run: shared context, pause gate and single story attempts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::state::{BuildSummary, Control, ProjectRuntime, StateWriter};
use super::Collaborators;
use crate::agents::resolve_invocation;
use crate::config::{AutonomyPolicy, BuildMode};
use crate::error::BuildError;
use crate::history::{ProcessHistoryStore, ProcessRecord};
use crate::model::{BuildStatus, LogEntry, Story, StoryStatus};
use crate::prompt::build_story_prompt;
use crate::retry::build_retry_context;
use crate::runner::{OutputLine, SpawnRequest};

/// How long to keep reading output after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Immutable inputs of one run plus its handle on the project runtime.
pub(crate) struct RunContext {
    pub project_id: String,
    pub repo_path: PathBuf,
    pub run_id: u64,
    pub runtime: Arc<ProjectRuntime>,
    pub collaborators: Collaborators,
    pub agent_id: String,
    pub agent_paths: HashMap<String, String>,
    pub autonomy: AutonomyPolicy,
    pub mode: BuildMode,
    pub max_parallel: usize,
    pub record_history: bool,
}

/// Result of running one agent attempt.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Succeeded,
    Failed(BuildError),
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

impl RunContext {
    pub fn update<R>(&self, f: impl FnOnce(&mut StateWriter<'_>) -> R) -> Option<R> {
        self.runtime.update(self.run_id, f)
    }

    pub fn is_current(&self) -> bool {
        self.runtime.is_current(self.run_id)
    }

    pub fn control(&self) -> watch::Receiver<Control> {
        self.runtime.control()
    }

    /// Pauses the build on the loop's own initiative.
    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(project_id = %self.project_id, reason = %reason, "Pausing build");
        self.update(|w| {
            w.system(reason);
            w.set_status(BuildStatus::Paused);
        });
    }

    /// Records the end of the run and returns the project to idle.
    pub fn finish(&self) {
        let summary = self.update(|w| {
            let summary = BuildSummary {
                complete: w.count(StoryStatus::Complete),
                failed: w.count(StoryStatus::Failed),
                blocked: w.count(StoryStatus::Pending),
                conflicts: w.conflicts.len(),
            };
            w.system(format!(
                "Build finished: {} complete, {} failed, {} blocked, {} awaiting conflict resolution",
                summary.complete, summary.failed, summary.blocked, summary.conflicts
            ));
            w.finish(summary);
            summary
        });
        if let Some(summary) = summary {
            info!(
                project_id = %self.project_id,
                complete = summary.complete,
                failed = summary.failed,
                blocked = summary.blocked,
                conflicts = summary.conflicts,
                "Build finished"
            );
        }
    }

    /// Persists `passes = true`; a backlog write failure is logged only.
    pub async fn mark_passed(&self, story_id: &str) {
        if let Err(err) = self
            .collaborators
            .backlog
            .mark_passed(&self.repo_path, story_id)
            .await
        {
            warn!(story_id = %story_id, error = %err, "Failed to persist story completion");
            self.update(|w| w.story_system(story_id, format!("Could not save completion: {}", err)));
        }
    }
}

/// Blocks while the build is held. Returns `false` once the run is cancelled.
pub(crate) async fn wait_for_proceed(rx: &mut watch::Receiver<Control>) -> bool {
    loop {
        match *rx.borrow_and_update() {
            Control::Proceed => return true,
            Control::Cancel => return false,
            Control::Hold => {}
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

fn record_output(ctx: &RunContext, story_id: &str, line: OutputLine, attempt_logs: &mut Vec<LogEntry>) {
    let entry = LogEntry::new(line.channel, line.text).for_story(story_id);
    attempt_logs.push(entry.clone());
    ctx.update(|w| w.log(entry));
}

/// Runs one attempt of `story` with the agent rooted at `working_dir`.
///
/// Marks the story in progress, injects the retry context of earlier failed
/// attempts, and stores this attempt's output for the next retry.
pub(crate) async fn run_attempt(ctx: &RunContext, story: &Story, working_dir: &Path) -> AttemptOutcome {
    let story_id = story.id.as_str();
    let sequential = ctx.mode == BuildMode::Ralph;

    let Some(retry) = ctx.update(|w| {
        let retry = w.retries.entry(story_id.to_string()).or_default();
        if !retry.previous_logs.is_empty() {
            retry.retry_count += 1;
        }
        let retry = retry.clone();
        if sequential {
            w.current_story_id = Some(story_id.to_string());
        }
        w.set_story_status(story_id, StoryStatus::InProgress);
        let attempt = retry.retry_count + 1;
        w.story_system(story_id, format!("Starting story {}: {} (attempt {})", story_id, story.title, attempt));
        retry
    }) else {
        return AttemptOutcome::Cancelled;
    };

    let retry_context = build_retry_context(&retry);
    let prompt = build_story_prompt(story, retry_context.as_deref());
    let invocation = match resolve_invocation(&ctx.agent_id, &prompt, &ctx.agent_paths) {
        Ok(invocation) => invocation,
        Err(err) => return AttemptOutcome::Failed(err.into()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = SpawnRequest {
        executable: invocation.executable,
        args: invocation.args,
        working_dir: working_dir.to_path_buf(),
        label: story_id.to_string(),
    };
    let started_at = Utc::now();
    let runner = &ctx.collaborators.runner;
    let process_id = match runner.spawn(request, tx).await {
        Ok(process_id) => process_id,
        Err(err) => {
            let err = BuildError::from(err);
            warn!(story_id = %story_id, error = %err, "Agent spawn failed");
            ctx.update(|w| {
                w.story_system(story_id, err.to_string());
                w.retries
                    .entry(story_id.to_string())
                    .or_default()
                    .previous_logs
                    .push(vec![LogEntry::system(err.to_string()).for_story(story_id)]);
            });
            return AttemptOutcome::Failed(err);
        }
    };

    let tracked = ctx.update(|w| {
        w.active_processes.insert(story_id.to_string(), process_id.clone());
        if sequential {
            w.current_process_id = Some(process_id.clone());
        }
    });
    if tracked.is_none() {
        // Cancelled between spawn and registration; the canceller never saw it.
        debug!(story_id = %story_id, process_id = %process_id, "Killing agent spawned during cancel");
        if let Err(err) = runner.kill(&process_id).await {
            warn!(process_id = %process_id, error = %err, "Failed to kill agent");
        }
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, runner.wait(&process_id)).await;
        return AttemptOutcome::Cancelled;
    }
    debug!(story_id = %story_id, process_id = %process_id, dir = %working_dir.display(), "Agent running");

    let mut attempt_logs = Vec::new();
    let wait = runner.wait(&process_id);
    tokio::pin!(wait);
    let result = loop {
        tokio::select! {
            Some(line) = rx.recv() => record_output(ctx, story_id, line, &mut attempt_logs),
            result = &mut wait => break result,
        }
    };
    while let Ok(Some(line)) = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, rx.recv()).await {
        record_output(ctx, story_id, line, &mut attempt_logs);
    }

    let outcome = match &result {
        Ok(status) if status.success => AttemptOutcome::Succeeded,
        Ok(status) => AttemptOutcome::Failed(BuildError::AgentExecutionFailure {
            story_id: story_id.to_string(),
            exit_code: status.exit_code,
        }),
        Err(err) => AttemptOutcome::Failed(BuildError::Runner(err.to_string())),
    };

    if ctx.record_history {
        let (exit_code, success) = match &result {
            Ok(status) => (status.exit_code, status.success),
            Err(_) => (None, false),
        };
        let record = ProcessRecord::story_attempt(process_id.clone(), ctx.project_id.clone(), story_id, started_at)
            .with_exit(exit_code, success)
            .with_agent(ctx.agent_id.clone());
        if let Err(err) = ProcessHistoryStore::for_repo(&ctx.repo_path).record(record, &attempt_logs) {
            warn!(story_id = %story_id, error = %err, "Failed to save process history");
        }
    }

    let still_current = ctx.update(|w| {
        w.active_processes.remove(story_id);
        w.retries
            .entry(story_id.to_string())
            .or_default()
            .previous_logs
            .push(attempt_logs);
    });
    if still_current.is_none() {
        return AttemptOutcome::Cancelled;
    }
    outcome
}
