//! Scripted in-memory collaborators for scheduler tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use super::{BuildCoordinator, Collaborators};
use crate::backlog::{Backlog, BacklogError};
use crate::config::StaticSettings;
use crate::dependency::DeclaredDependencies;
use crate::model::{BuildStatus, LogChannel, Story, Worktree};
use crate::runner::{AgentRunner, ExitStatus, OutputLine, ProcessId, RunnerError, SpawnRequest};
use crate::worktree::{
    ConflictFile, FileResolution, MergeBackend, MergeConflictAnalysis, WorktreeError, WorktreeManager,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(coordinator: &BuildCoordinator, project_id: &str, status: BuildStatus) {
    wait_for(|| coordinator.status(project_id) == status).await;
}

struct FakeProcess {
    label: String,
    exit_tx: Option<oneshot::Sender<ExitStatus>>,
    exit_rx: Option<oneshot::Receiver<ExitStatus>>,
    output: Option<mpsc::UnboundedSender<OutputLine>>,
}

#[derive(Default)]
struct FakeRunnerState {
    next_id: u64,
    processes: HashMap<ProcessId, FakeProcess>,
    spawned: Vec<SpawnRequest>,
    /// Remaining scripted failures per label.
    failures: HashMap<String, usize>,
    live_sets: Vec<HashSet<String>>,
    peak_live: usize,
    killed: usize,
}

impl FakeRunnerState {
    fn live_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .processes
            .values()
            .filter(|p| p.exit_tx.is_some())
            .map(|p| p.label.clone())
            .collect();
        labels.sort();
        labels
    }

    fn note_live(&mut self) {
        let live = self.live_labels();
        self.peak_live = self.peak_live.max(live.len());
        self.live_sets.push(live.into_iter().collect());
    }

    fn exit(&mut self, process_id: &str, status: ExitStatus, line: Option<OutputLine>) -> bool {
        let Some(process) = self.processes.get_mut(process_id) else {
            return false;
        };
        let Some(exit_tx) = process.exit_tx.take() else {
            return false;
        };
        if let (Some(output), Some(line)) = (process.output.take(), line) {
            let _ = output.send(line);
        }
        let _ = exit_tx.send(status);
        true
    }
}

/// [`AgentRunner`] whose processes exit when told to, or immediately in auto mode.
pub struct FakeRunner {
    auto: bool,
    state: Mutex<FakeRunnerState>,
}

impl FakeRunner {
    /// Processes run until [`finish`](Self::finish) or a kill.
    pub fn manual() -> Self {
        Self {
            auto: false,
            state: Mutex::new(FakeRunnerState::default()),
        }
    }

    /// Processes succeed as soon as they are spawned.
    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::manual()
        }
    }

    /// The next attempt for `label` fails with an error on stderr.
    pub fn failing_once(self, label: &str) -> Self {
        *lock(&self.state).failures.entry(label.to_string()).or_default() += 1;
        self
    }

    fn outcome_line(label: &str, success: bool) -> (ExitStatus, OutputLine) {
        if success {
            (
                ExitStatus {
                    exit_code: Some(0),
                    success: true,
                },
                OutputLine {
                    channel: LogChannel::Stdout,
                    text: format!("{} done", label),
                },
            )
        } else {
            (
                ExitStatus {
                    exit_code: Some(1),
                    success: false,
                },
                OutputLine {
                    channel: LogChannel::Stderr,
                    text: format!("error: {} failed", label),
                },
            )
        }
    }

    /// Ends the live process labelled `label`. Returns `false` if none is live.
    pub fn finish(&self, label: &str, success: bool) -> bool {
        let mut state = lock(&self.state);
        let process_id = state
            .processes
            .iter()
            .find(|(_, p)| p.label == label && p.exit_tx.is_some())
            .map(|(id, _)| id.clone());
        let Some(process_id) = process_id else {
            return false;
        };
        let (status, line) = Self::outcome_line(label, success);
        state.exit(&process_id, status, Some(line))
    }

    /// Labels of every spawn, in order.
    pub fn spawned_labels(&self) -> Vec<String> {
        lock(&self.state).spawned.iter().map(|r| r.label.clone()).collect()
    }

    /// Prompt handed to the `n`th spawn.
    pub fn prompt_of(&self, n: usize) -> String {
        lock(&self.state)
            .spawned
            .get(n)
            .map(|r| r.args.join(" "))
            .unwrap_or_default()
    }

    pub fn working_dir_of(&self, n: usize) -> PathBuf {
        lock(&self.state)
            .spawned
            .get(n)
            .map(|r| r.working_dir.clone())
            .unwrap_or_default()
    }

    /// Labels of processes that have not exited, sorted.
    pub fn live_labels(&self) -> Vec<String> {
        lock(&self.state).live_labels()
    }

    pub fn peak_live(&self) -> usize {
        lock(&self.state).peak_live
    }

    pub fn killed_count(&self) -> usize {
        lock(&self.state).killed
    }

    /// Whether `a` and `b` were ever running at the same moment.
    pub fn ever_live_together(&self, a: &str, b: &str) -> bool {
        lock(&self.state)
            .live_sets
            .iter()
            .any(|live| live.contains(a) && live.contains(b))
    }
}

#[async_trait]
impl AgentRunner for FakeRunner {
    async fn spawn(
        &self,
        request: SpawnRequest,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ProcessId, RunnerError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let process_id = format!("fake-{}", state.next_id);
        let label = request.label.clone();
        state.spawned.push(request);

        let (exit_tx, exit_rx) = oneshot::channel();
        state.processes.insert(
            process_id.clone(),
            FakeProcess {
                label: label.clone(),
                exit_tx: Some(exit_tx),
                exit_rx: Some(exit_rx),
                output: Some(output),
            },
        );
        state.note_live();

        let scripted_failure = match state.failures.get_mut(&label) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if self.auto || scripted_failure {
            let (status, line) = Self::outcome_line(&label, !scripted_failure);
            state.exit(&process_id, status, Some(line));
        }
        Ok(process_id)
    }

    async fn wait(&self, process_id: &str) -> Result<ExitStatus, RunnerError> {
        let exit_rx = lock(&self.state)
            .processes
            .get_mut(process_id)
            .and_then(|p| p.exit_rx.take())
            .ok_or_else(|| RunnerError::UnknownProcess(process_id.to_string()))?;
        let status = exit_rx.await.unwrap_or_else(|_| ExitStatus::killed());
        lock(&self.state).processes.remove(process_id);
        Ok(status)
    }

    async fn kill(&self, process_id: &str) -> Result<(), RunnerError> {
        let mut state = lock(&self.state);
        if !state.processes.contains_key(process_id) {
            return Err(RunnerError::UnknownProcess(process_id.to_string()));
        }
        if state.exit(process_id, ExitStatus::killed(), None) {
            state.killed += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeWorktreeState {
    open: HashMap<String, Worktree>,
    finalized: Vec<(String, bool)>,
    conflict_on: HashSet<String>,
    cleanups: usize,
}

/// [`WorktreeManager`] that only keeps records.
#[derive(Default)]
pub struct FakeWorktrees {
    state: Mutex<FakeWorktreeState>,
    held_finalize: Mutex<Option<String>>,
    finalize_gate: Notify,
}

impl FakeWorktrees {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalizing `story_id` successfully reports a merge conflict.
    pub fn with_conflict(self, story_id: &str) -> Self {
        lock(&self.state).conflict_on.insert(story_id.to_string());
        self
    }

    /// Finalizing `story_id` blocks until [`release_finalize`](Self::release_finalize).
    pub fn holding_finalize(self, story_id: &str) -> Self {
        *lock(&self.held_finalize) = Some(story_id.to_string());
        self
    }

    pub fn release_finalize(&self) {
        self.finalize_gate.notify_one();
    }

    pub fn path_for(story_id: &str) -> PathBuf {
        PathBuf::from("/worktrees").join(story_id.to_lowercase())
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).open.len()
    }

    pub fn finalized(&self) -> Vec<(String, bool)> {
        lock(&self.state).finalized.clone()
    }

    pub fn cleanup_count(&self) -> usize {
        lock(&self.state).cleanups
    }
}

#[async_trait]
impl WorktreeManager for FakeWorktrees {
    async fn prepare(&self, _repo_path: &Path, story_id: &str) -> Result<Worktree, WorktreeError> {
        let worktree = Worktree {
            path: Self::path_for(story_id).to_string_lossy().to_string(),
            branch: format!("story/{}", story_id.to_lowercase()),
        };
        lock(&self.state).open.insert(story_id.to_string(), worktree.clone());
        Ok(worktree)
    }

    async fn finalize(
        &self,
        _repo_path: &Path,
        story_id: &str,
        worktree: &Worktree,
        success: bool,
    ) -> Result<(), WorktreeError> {
        let conflict = {
            let mut state = lock(&self.state);
            state.open.remove(story_id);
            state.finalized.push((story_id.to_string(), success));
            state.conflict_on.contains(story_id)
        };
        let held = lock(&self.held_finalize).as_deref() == Some(story_id);
        if held {
            self.finalize_gate.notified().await;
        }
        if success && conflict {
            return Err(WorktreeError::MergeConflict {
                branch: worktree.branch.clone(),
                detail: "CONFLICT (content): Merge conflict in src/lib.rs".to_string(),
            });
        }
        Ok(())
    }

    async fn cleanup_all(&self, _repo_path: &Path) -> Result<(), WorktreeError> {
        let mut state = lock(&self.state);
        state.open.clear();
        state.cleanups += 1;
        Ok(())
    }
}

/// [`MergeBackend`] with scripted conflicts per branch.
#[derive(Default)]
pub struct FakeMerge {
    analyses: Mutex<HashMap<String, MergeConflictAnalysis>>,
    fail_merges: AtomicBool,
    merges: Mutex<Vec<(String, Vec<FileResolution>)>>,
    aborts: AtomicUsize,
}

impl FakeMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// `files` are `(path, base, ours, theirs)`.
    pub fn with_conflicts(self, branch: &str, files: &[(&str, &str, &str, &str)], clean_count: usize) -> Self {
        let analysis = MergeConflictAnalysis {
            branch_name: branch.to_string(),
            files: files
                .iter()
                .map(|(path, base, ours, theirs)| ConflictFile {
                    path: path.to_string(),
                    base: base.to_string(),
                    ours: ours.to_string(),
                    theirs: theirs.to_string(),
                })
                .collect(),
            clean_count,
        };
        lock(&self.analyses).insert(branch.to_string(), analysis);
        self
    }

    pub fn failing_merges(self) -> Self {
        self.fail_merges.store(true, Ordering::SeqCst);
        self
    }

    pub fn merges(&self) -> Vec<(String, Vec<FileResolution>)> {
        lock(&self.merges).clone()
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MergeBackend for FakeMerge {
    async fn analyze_conflicts(
        &self,
        _repo_path: &Path,
        branch_name: &str,
    ) -> Result<MergeConflictAnalysis, WorktreeError> {
        Ok(lock(&self.analyses)
            .get(branch_name)
            .cloned()
            .unwrap_or_else(|| MergeConflictAnalysis {
                branch_name: branch_name.to_string(),
                files: Vec::new(),
                clean_count: 1,
            }))
    }

    async fn merge_with_resolutions(
        &self,
        _repo_path: &Path,
        branch_name: &str,
        resolutions: &[FileResolution],
    ) -> Result<(), WorktreeError> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(WorktreeError::Operation("git commit failed".to_string()));
        }
        lock(&self.merges).push((branch_name.to_string(), resolutions.to_vec()));
        Ok(())
    }

    async fn abort_merge(&self, _repo_path: &Path) -> Result<(), WorktreeError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory backlog.
pub struct MemoryBacklog {
    stories: Mutex<Vec<Story>>,
    hold_loads: AtomicBool,
    load_parked: AtomicBool,
    load_gate: Notify,
}

impl MemoryBacklog {
    pub fn new(stories: Vec<Story>) -> Self {
        Self {
            stories: Mutex::new(stories),
            hold_loads: AtomicBool::new(false),
            load_parked: AtomicBool::new(false),
            load_gate: Notify::new(),
        }
    }

    /// Later loads block until [`release_loads`](Self::release_loads).
    pub fn hold_loads(&self) {
        self.hold_loads.store(true, Ordering::SeqCst);
    }

    pub fn release_loads(&self) {
        self.hold_loads.store(false, Ordering::SeqCst);
        self.load_gate.notify_waiters();
    }

    /// Whether a load is blocked on the gate.
    pub fn load_parked(&self) -> bool {
        self.load_parked.load(Ordering::SeqCst)
    }

    pub fn passed(&self, story_id: &str) -> bool {
        lock(&self.stories).iter().any(|s| s.id == story_id && s.passes)
    }
}

#[async_trait]
impl Backlog for MemoryBacklog {
    async fn load_stories(&self, _repo_path: &Path) -> Result<Vec<Story>, BacklogError> {
        if self.hold_loads.load(Ordering::SeqCst) {
            let released = self.load_gate.notified();
            self.load_parked.store(true, Ordering::SeqCst);
            released.await;
            self.load_parked.store(false, Ordering::SeqCst);
        }
        Ok(lock(&self.stories).clone())
    }

    async fn mark_passed(&self, _repo_path: &Path, story_id: &str) -> Result<(), BacklogError> {
        let mut stories = lock(&self.stories);
        let story = stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| BacklogError::UnknownStory(story_id.to_string()))?;
        story.passes = true;
        Ok(())
    }
}

/// A coordinator wired to fakes, with handles on each fake.
pub struct Harness {
    pub coordinator: BuildCoordinator,
    pub runner: Arc<FakeRunner>,
    pub worktrees: Arc<FakeWorktrees>,
    pub merge: Arc<FakeMerge>,
    pub backlog: Arc<MemoryBacklog>,
}

pub fn harness(stories: Vec<Story>, settings: StaticSettings, runner: FakeRunner) -> Harness {
    harness_with(stories, settings, runner, FakeWorktrees::new())
}

pub fn harness_with(
    stories: Vec<Story>,
    settings: StaticSettings,
    runner: FakeRunner,
    worktrees: FakeWorktrees,
) -> Harness {
    let runner = Arc::new(runner);
    let worktrees = Arc::new(worktrees);
    let merge = Arc::new(FakeMerge::new());
    let backlog = Arc::new(MemoryBacklog::new(stories));
    let coordinator = BuildCoordinator::new(Collaborators {
        runner: runner.clone(),
        worktrees: worktrees.clone(),
        merge: merge.clone(),
        dependencies: Arc::new(DeclaredDependencies),
        settings: Arc::new(settings),
        backlog: backlog.clone(),
    });
    Harness {
        coordinator,
        runner,
        worktrees,
        merge,
        backlog,
    }
}
