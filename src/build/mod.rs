//! Build coordinator.
//!
//! One [`BuildCoordinator`] owns the build state of every project it has seen,
//! keyed by project id. Each project has at most one scheduling loop; the
//! `idle -> running` transition happens under the project's state lock, so
//! a second start is rejected rather than racing the first.
//!
//! Commands:
//! - [`start`](BuildCoordinator::start) / [`run_from`](BuildCoordinator::run_from): `idle` only
//! - [`pause`](BuildCoordinator::pause): `running` only
//! - [`resume`](BuildCoordinator::resume): `paused` only
//! - [`cancel_and_kill_all`](BuildCoordinator::cancel_and_kill_all): `running` or `paused`

mod parallel;
mod run;
mod sequential;
mod state;

#[cfg(test)]
pub(crate) mod fakes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

pub use state::{BuildEvent, BuildState, BuildSummary};

use crate::agents::find_agent;
use crate::backlog::{Backlog, PrdBacklog};
use crate::config::{BuildMode, ConfigError, FileSettings, SettingsProvider};
use crate::conflict::{ConflictPhase, ConflictSession};
use crate::dependency::{DeclaredDependencies, DependencyAnalyzer};
use crate::error::{BuildError, BuildResult};
use crate::model::{sort_by_priority, BuildStatus, Story, StoryStatus};
use crate::runner::{AgentRunner, ProcessRunner};
use crate::worktree::{GitWorktrees, MergeBackend, WorktreeManager};
use run::RunContext;
use state::ProjectRuntime;

/// Agent used when neither the project nor the preferences name one.
pub const DEFAULT_AGENT: &str = "claude-code";

/// How long a cancel waits for the loop to wind down before aborting it.
const CANCEL_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn AgentRunner>,
    pub worktrees: Arc<dyn WorktreeManager>,
    pub merge: Arc<dyn MergeBackend>,
    pub dependencies: Arc<dyn DependencyAnalyzer>,
    pub settings: Arc<dyn SettingsProvider>,
    pub backlog: Arc<dyn Backlog>,
}

impl Collaborators {
    /// Real processes, git worktrees, declared dependencies, on-disk settings
    /// and the `prd.json` backlog.
    pub fn system() -> Self {
        let git = Arc::new(GitWorktrees::new());
        Self {
            runner: Arc::new(ProcessRunner::new()),
            worktrees: git.clone(),
            merge: git,
            dependencies: Arc::new(DeclaredDependencies),
            settings: Arc::new(FileSettings::new()),
            backlog: Arc::new(PrdBacklog::new()),
        }
    }
}

/// Parameters of a build start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub project_id: String,
    pub repo_path: PathBuf,
    /// Overrides the project's configured build mode.
    pub mode: Option<BuildMode>,
    /// Overrides the `max_parallel_agents` preference.
    pub max_parallel: Option<usize>,
}

impl BuildRequest {
    pub fn new(project_id: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            repo_path: repo_path.into(),
            mode: None,
            max_parallel: None,
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }
}

/// Stories a run will schedule, in priority order.
///
/// Without `start_at`, every story not yet passing. With it, the stories from
/// that backlog position on; the named story runs even if it already passes.
fn select_queue(stories: &[Story], start_at: Option<&str>) -> BuildResult<Vec<Story>> {
    let mut ordered = stories.to_vec();
    sort_by_priority(&mut ordered);
    match start_at {
        None => Ok(ordered.into_iter().filter(|s| !s.passes).collect()),
        Some(story_id) => {
            let position = ordered
                .iter()
                .position(|s| s.id == story_id)
                .ok_or_else(|| BuildError::UnknownStory(story_id.to_string()))?;
            Ok(ordered
                .into_iter()
                .skip(position)
                .filter(|s| s.id == story_id || !s.passes)
                .collect())
        }
    }
}

/// Owns every project's build state and scheduling loop.
pub struct BuildCoordinator {
    collaborators: Collaborators,
    record_history: bool,
    projects: Mutex<HashMap<String, Arc<ProjectRuntime>>>,
}

impl BuildCoordinator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            record_history: false,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Persists every agent attempt under `<repo>/.ideate/`.
    pub fn with_history(mut self, enabled: bool) -> Self {
        self.record_history = enabled;
        self
    }

    fn projects(&self) -> MutexGuard<'_, HashMap<String, Arc<ProjectRuntime>>> {
        self.projects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn runtime(&self, project_id: &str) -> Arc<ProjectRuntime> {
        self.projects()
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(ProjectRuntime::new(project_id)))
            .clone()
    }

    fn existing(&self, project_id: &str) -> BuildResult<Arc<ProjectRuntime>> {
        self.projects()
            .get(project_id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownProject(project_id.to_string()))
    }

    /// Starts a build of every story that does not pass yet.
    pub async fn start(&self, request: BuildRequest) -> BuildResult<()> {
        self.launch("start", request, None).await
    }

    /// Starts a build at `story_id`'s position in the priority-ordered backlog.
    pub async fn run_from(&self, request: BuildRequest, story_id: &str) -> BuildResult<()> {
        self.launch("run from", request, Some(story_id)).await
    }

    async fn launch(&self, command: &'static str, request: BuildRequest, start_at: Option<&str>) -> BuildResult<()> {
        let runtime = self.runtime(&request.project_id);
        let run_id = runtime.begin_run(command, request.repo_path.clone())?;

        let prepared = self.prepare_run(&request, &runtime, run_id, start_at).await;
        let (ctx, all_stories, queue) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(project_id = %request.project_id, error = %err, "Build failed to start");
                runtime.abandon_run(run_id, &err.to_string());
                return Err(err);
            }
        };

        // A cancel bumps the run id before it takes the handle, so checking
        // under the handle lock never leaves a stale loop behind.
        let mut loop_handle = runtime.loop_handle.lock().await;
        if !runtime.is_current(run_id) {
            info!(project_id = %request.project_id, run_id, "Build cancelled before its loop started");
            return Err(BuildError::InvalidTransition {
                command,
                status: runtime.status(),
            });
        }
        *loop_handle = Some(tokio::spawn(run_build(Arc::new(ctx), all_stories, queue)));
        Ok(())
    }

    async fn prepare_run(
        &self,
        request: &BuildRequest,
        runtime: &Arc<ProjectRuntime>,
        run_id: u64,
        start_at: Option<&str>,
    ) -> BuildResult<(RunContext, Vec<Story>, Vec<Story>)> {
        let settings = self.collaborators.settings.load_build_settings(&request.repo_path)?;
        let preferences = self.collaborators.settings.load_global_preferences()?;
        let agent_id = settings
            .agent
            .clone()
            .or_else(|| preferences.default_agent.clone())
            .unwrap_or_else(|| DEFAULT_AGENT.to_string());
        if find_agent(&agent_id).is_none() {
            return Err(ConfigError::UnknownAgent(agent_id).into());
        }

        let stories = self.collaborators.backlog.load_stories(&request.repo_path).await?;
        let queue = select_queue(&stories, start_at)?;
        let mode = request.mode.unwrap_or(settings.mode);
        let max_parallel = request
            .max_parallel
            .map(|n| n.max(1))
            .unwrap_or_else(|| preferences.parallel_limit());

        runtime.update(run_id, |w| {
            w.mode = Some(mode);
            w.story_order = queue.iter().map(|s| s.id.clone()).collect();
            for story in &queue {
                w.set_story_status(&story.id, StoryStatus::Pending);
            }
            w.system(format!(
                "Starting {} build of {} stories with {} ({})",
                mode,
                queue.len(),
                agent_id,
                settings.autonomy
            ));
        });
        info!(
            project_id = %request.project_id,
            mode = %mode,
            autonomy = %settings.autonomy,
            agent = %agent_id,
            stories = queue.len(),
            "Prepared build"
        );

        let ctx = RunContext {
            project_id: request.project_id.clone(),
            repo_path: request.repo_path.clone(),
            run_id,
            runtime: runtime.clone(),
            collaborators: self.collaborators.clone(),
            agent_id,
            agent_paths: preferences.agent_paths.clone(),
            autonomy: settings.autonomy,
            mode,
            max_parallel,
            record_history: self.record_history,
        };
        Ok((ctx, stories, queue))
    }

    /// Resumes a paused build.
    pub fn resume(&self, project_id: &str) -> BuildResult<()> {
        self.existing(project_id)?
            .transition("resume", BuildStatus::Paused, BuildStatus::Running)
    }

    /// Holds the build before its next story. Running agents continue.
    pub fn pause(&self, project_id: &str) -> BuildResult<()> {
        self.existing(project_id)?
            .transition("pause", BuildStatus::Running, BuildStatus::Paused)
    }

    /// Kills every agent of the project, removes its worktrees and returns it
    /// to idle. Cleanup failures are logged, never returned.
    pub async fn cancel_and_kill_all(&self, project_id: &str) -> BuildResult<()> {
        let runtime = self.existing(project_id)?;
        let (processes, repo_path, mode) = runtime.begin_cancel()?;
        info!(project_id = %project_id, processes = processes.len(), "Cancelling build");

        for process_id in &processes {
            if let Err(err) = self.collaborators.runner.kill(process_id).await {
                warn!(project_id = %project_id, process_id = %process_id, error = %err, "Failed to kill agent");
            }
        }

        let handle = runtime.loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CANCEL_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!(project_id = %project_id, "Build loop did not stop in time, aborting it");
                handle.abort();
            }
        }

        if mode == Some(BuildMode::Parallel) {
            if let Some(repo_path) = repo_path {
                if let Err(err) = self.collaborators.worktrees.cleanup_all(&repo_path).await {
                    warn!(project_id = %project_id, error = %err, "Worktree cleanup failed");
                    runtime.update_any(|w| w.system(format!("Worktree cleanup failed: {}", err)));
                }
            }
        }

        runtime.finish_cancel();
        Ok(())
    }

    pub fn status(&self, project_id: &str) -> BuildStatus {
        self.projects()
            .get(project_id)
            .map(|runtime| runtime.status())
            .unwrap_or_default()
    }

    /// Copy of the project's current state, if it ever built.
    pub fn snapshot(&self, project_id: &str) -> Option<BuildState> {
        self.projects().get(project_id).map(|runtime| runtime.snapshot())
    }

    /// Live events for the project, including builds started later.
    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<BuildEvent> {
        self.runtime(project_id).subscribe()
    }

    /// Opens a resolution session for the recorded conflict of `story_id`.
    pub async fn conflict_session(&self, project_id: &str, story_id: &str) -> BuildResult<ConflictSession> {
        let snapshot = self.existing(project_id)?.snapshot();
        let conflict = snapshot
            .conflicts
            .iter()
            .find(|c| c.story_id == story_id)
            .ok_or_else(|| BuildError::UnknownConflict(story_id.to_string()))?;
        let repo_path = snapshot
            .repo_path
            .clone()
            .ok_or_else(|| BuildError::UnknownProject(project_id.to_string()))?;
        ConflictSession::for_conflict(self.collaborators.merge.clone(), repo_path, conflict).await
    }

    /// Records a merged session: the conflict leaves the registry and its
    /// story counts as complete. The story is not re-run.
    pub async fn settle_conflict(&self, project_id: &str, session: &ConflictSession) -> BuildResult<()> {
        let runtime = self.existing(project_id)?;
        if session.phase() != ConflictPhase::Merged {
            return Err(BuildError::NotReady {
                phase: session.phase().as_label(),
                action: "settle",
            });
        }
        let story_id = session
            .story_id()
            .ok_or_else(|| BuildError::UnknownConflict(session.branch_name().to_string()))?;

        let found = runtime.update_any(|w| {
            let before = w.conflicts.len();
            w.conflicts.retain(|c| c.story_id != story_id);
            if w.conflicts.len() == before {
                return false;
            }
            w.set_story_status(story_id, StoryStatus::Complete);
            w.story_system(story_id, format!("Conflict resolved, {} merged", session.branch_name()));
            if let Some(summary) = w.summary.as_mut() {
                summary.conflicts = summary.conflicts.saturating_sub(1);
                summary.failed = summary.failed.saturating_sub(1);
                summary.complete += 1;
            }
            true
        });
        if !found {
            return Err(BuildError::UnknownConflict(story_id.to_string()));
        }

        self.collaborators
            .backlog
            .mark_passed(session.repo_path(), story_id)
            .await?;
        info!(project_id = %project_id, story_id = %story_id, "Conflict settled");
        Ok(())
    }
}

/// Body of the scheduling task.
async fn run_build(ctx: Arc<RunContext>, all_stories: Vec<Story>, queue: Vec<Story>) {
    if queue.is_empty() {
        ctx.update(|w| w.system("Nothing to build, every story passes"));
        ctx.finish();
        return;
    }
    match ctx.mode {
        BuildMode::Ralph => sequential::run_sequential(&ctx, queue).await,
        BuildMode::Parallel => parallel::run_parallel(ctx.clone(), all_stories, queue).await,
    }
}
