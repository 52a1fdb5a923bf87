//! Per-project build state and the runtime guarding it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BuildMode;
use crate::error::{BuildError, BuildResult};
use crate::model::{BuildStatus, ConflictInfo, LogEntry, RetryInfo, StoryStatus, Worktree};
use crate::runner::ProcessId;

const EVENT_CAPACITY: usize = 1024;

/// End-of-run counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub complete: usize,
    pub failed: usize,
    /// Stories left pending because their prerequisites never completed.
    pub blocked: usize,
    /// Stories whose branch awaits manual conflict resolution.
    pub conflicts: usize,
}

impl BuildSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.conflicts == 0
    }
}

/// State of one project's build, as exposed to observers.
#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub status: BuildStatus,
    pub mode: Option<BuildMode>,
    pub repo_path: Option<PathBuf>,
    /// Sequential mode only.
    pub current_story_id: Option<String>,
    /// Sequential mode only.
    pub current_process_id: Option<ProcessId>,
    pub story_statuses: HashMap<String, StoryStatus>,
    /// Stories of the current run in scheduling order.
    pub story_order: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub retries: HashMap<String, RetryInfo>,
    pub conflicts: Vec<ConflictInfo>,
    /// Story id to the agent process running it.
    pub active_processes: HashMap<String, ProcessId>,
    /// Story id to its open worktree (parallel mode).
    pub worktrees: HashMap<String, Worktree>,
    pub summary: Option<BuildSummary>,
    run_id: u64,
}

impl BuildState {
    pub fn story_status(&self, story_id: &str) -> Option<StoryStatus> {
        self.story_statuses.get(story_id).copied()
    }

    pub fn count(&self, status: StoryStatus) -> usize {
        self.story_statuses.values().filter(|s| **s == status).count()
    }

    pub fn retry_count(&self, story_id: &str) -> u32 {
        self.retries.get(story_id).map(|r| r.retry_count).unwrap_or(0)
    }
}

/// Change notifications published by a project's build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    StatusChanged {
        project_id: String,
        status: BuildStatus,
    },
    StoryStatusChanged {
        project_id: String,
        story_id: String,
        status: StoryStatus,
    },
    Log {
        project_id: String,
        entry: LogEntry,
    },
    ConflictRecorded {
        project_id: String,
        conflict: ConflictInfo,
    },
    Finished {
        project_id: String,
        summary: BuildSummary,
    },
}

/// Signal the scheduling loop blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Proceed,
    Hold,
    Cancel,
}

/// Mutable view of the state that publishes every change it makes.
pub(crate) struct StateWriter<'a> {
    state: &'a mut BuildState,
    events: &'a broadcast::Sender<BuildEvent>,
    control: &'a watch::Sender<Control>,
    project_id: &'a str,
}

impl StateWriter<'_> {
    fn emit(&self, event: BuildEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.state.logs.push(entry.clone());
        self.emit(BuildEvent::Log {
            project_id: self.project_id.to_string(),
            entry,
        });
    }

    pub fn system(&mut self, text: impl Into<String>) {
        self.log(LogEntry::system(text));
    }

    pub fn story_system(&mut self, story_id: &str, text: impl Into<String>) {
        self.log(LogEntry::system(text).for_story(story_id));
    }

    pub fn set_story_status(&mut self, story_id: &str, status: StoryStatus) {
        if self.state.story_statuses.get(story_id) == Some(&status) {
            return;
        }
        self.state.story_statuses.insert(story_id.to_string(), status);
        self.emit(BuildEvent::StoryStatusChanged {
            project_id: self.project_id.to_string(),
            story_id: story_id.to_string(),
            status,
        });
    }

    pub fn set_status(&mut self, status: BuildStatus) {
        if self.state.status == status {
            return;
        }
        self.state.status = status;
        let control = match status {
            BuildStatus::Paused => Control::Hold,
            BuildStatus::Running | BuildStatus::Idle => Control::Proceed,
        };
        self.control.send_replace(control);
        self.emit(BuildEvent::StatusChanged {
            project_id: self.project_id.to_string(),
            status,
        });
    }

    pub fn record_conflict(&mut self, conflict: ConflictInfo) {
        self.state.conflicts.retain(|c| c.story_id != conflict.story_id);
        self.state.conflicts.push(conflict.clone());
        self.emit(BuildEvent::ConflictRecorded {
            project_id: self.project_id.to_string(),
            conflict,
        });
    }

    pub fn finish(&mut self, summary: BuildSummary) {
        self.state.summary = Some(summary);
        self.state.current_story_id = None;
        self.state.current_process_id = None;
        self.state.active_processes.clear();
        self.state.worktrees.clear();
        self.set_status(BuildStatus::Idle);
        self.emit(BuildEvent::Finished {
            project_id: self.project_id.to_string(),
            summary,
        });
    }
}

impl Deref for StateWriter<'_> {
    type Target = BuildState;

    fn deref(&self) -> &BuildState {
        self.state
    }
}

impl DerefMut for StateWriter<'_> {
    fn deref_mut(&mut self) -> &mut BuildState {
        self.state
    }
}

/// Everything the coordinator keeps for one project.
///
/// Every status transition happens under the state lock together with the
/// matching control signal, so "already running" cannot be observed twice.
pub(crate) struct ProjectRuntime {
    project_id: String,
    state: Mutex<BuildState>,
    control: watch::Sender<Control>,
    events: broadcast::Sender<BuildEvent>,
    pub(crate) loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Serializes merges into the main line.
    pub(crate) finalize_lock: tokio::sync::Mutex<()>,
}

impl ProjectRuntime {
    pub fn new(project_id: impl Into<String>) -> Self {
        let (control, _) = watch::channel(Control::Proceed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            project_id: project_id.into(),
            state: Mutex::new(BuildState::default()),
            control,
            events,
            loop_handle: tokio::sync::Mutex::new(None),
            finalize_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_writer<R>(&self, state: &mut BuildState, f: impl FnOnce(&mut StateWriter<'_>) -> R) -> R {
        let mut writer = StateWriter {
            state,
            events: &self.events,
            control: &self.control,
            project_id: &self.project_id,
        };
        f(&mut writer)
    }

    pub fn snapshot(&self) -> BuildState {
        self.lock().clone()
    }

    pub fn status(&self) -> BuildStatus {
        self.lock().status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    /// Applies `f` if `run_id` is still the live run. Stale runs write nothing.
    pub fn update<R>(&self, run_id: u64, f: impl FnOnce(&mut StateWriter<'_>) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.run_id != run_id {
            return None;
        }
        Some(self.with_writer(&mut state, f))
    }

    /// Applies `f` regardless of which run is live.
    pub fn update_any<R>(&self, f: impl FnOnce(&mut StateWriter<'_>) -> R) -> R {
        let mut state = self.lock();
        self.with_writer(&mut state, f)
    }

    pub fn is_current(&self, run_id: u64) -> bool {
        self.lock().run_id == run_id
    }

    /// `idle -> running`: resets the state for a fresh run and returns its id.
    pub fn begin_run(&self, command: &'static str, repo_path: PathBuf) -> BuildResult<u64> {
        let mut state = self.lock();
        if state.status != BuildStatus::Idle {
            return Err(BuildError::InvalidTransition {
                command,
                status: state.status,
            });
        }
        let run_id = state.run_id + 1;
        *state = BuildState {
            repo_path: Some(repo_path),
            run_id,
            ..BuildState::default()
        };
        self.with_writer(&mut state, |w| w.set_status(BuildStatus::Running));
        info!(project_id = %self.project_id, run_id, "Build started");
        Ok(run_id)
    }

    /// Returns a run that failed before its loop started to idle.
    pub fn abandon_run(&self, run_id: u64, reason: &str) {
        self.update(run_id, |w| {
            w.system(format!("Build could not start: {}", reason));
            w.set_status(BuildStatus::Idle);
        });
    }

    /// `running | paused -> cancelling`: invalidates the live run and returns
    /// the processes to kill.
    pub fn begin_cancel(&self) -> BuildResult<(Vec<ProcessId>, Option<PathBuf>, Option<BuildMode>)> {
        let mut state = self.lock();
        if !matches!(state.status, BuildStatus::Running | BuildStatus::Paused) {
            return Err(BuildError::InvalidTransition {
                command: "cancel",
                status: state.status,
            });
        }
        state.run_id += 1;
        self.control.send_replace(Control::Cancel);
        let processes = state.active_processes.values().cloned().collect();
        Ok((processes, state.repo_path.clone(), state.mode))
    }

    /// Final step of a cancel: nothing active, nothing open, back to idle.
    pub fn finish_cancel(&self) {
        self.update_any(|w| {
            w.active_processes.clear();
            w.worktrees.clear();
            w.current_process_id = None;
            let in_progress: Vec<String> = w
                .story_statuses
                .iter()
                .filter(|(_, status)| **status == StoryStatus::InProgress)
                .map(|(id, _)| id.clone())
                .collect();
            for story_id in in_progress {
                w.set_story_status(&story_id, StoryStatus::Pending);
            }
            w.system("Build cancelled, all agents stopped");
            w.set_status(BuildStatus::Idle);
        });
        info!(project_id = %self.project_id, "Build cancelled");
    }

    /// Operator pause or resume.
    pub fn transition(&self, command: &'static str, from: BuildStatus, to: BuildStatus) -> BuildResult<()> {
        let mut state = self.lock();
        if state.status != from {
            return Err(BuildError::InvalidTransition {
                command,
                status: state.status,
            });
        }
        self.with_writer(&mut state, |w| {
            w.system(format!("Build {}", if to == BuildStatus::Paused { "paused" } else { "resumed" }));
            w.set_status(to);
        });
        info!(project_id = %self.project_id, command, "Build {}", to);
        Ok(())
    }
}
