//! Bounded-parallel mode.
//!
//! Ready stories are admitted in priority order into at most N slots, each in
//! its own worktree. A story is ready when it is pending, its prerequisites
//! are complete or already passing, and none of its conflicts is in progress.
//! Admission is the only place that check happens.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::run::{run_attempt, AttemptOutcome, RunContext};
use super::state::Control;
use crate::dependency::DependencyGraph;
use crate::error::BuildError;
use crate::model::{ConflictInfo, Story, StoryStatus};
use crate::worktree::WorktreeError;

/// How a scheduled story ended, as seen by the control loop.
#[derive(Debug)]
enum StoryResult {
    Completed,
    Failed(BuildError),
    /// Finalize could not merge; the branch was kept.
    Conflict { branch: String, detail: String },
    Cancelled,
}

/// Prepare worktree, run the agent inside it, finalize.
async fn execute_in_worktree(ctx: Arc<RunContext>, story: Story) -> (Story, StoryResult) {
    let worktree = match ctx.collaborators.worktrees.prepare(&ctx.repo_path, &story.id).await {
        Ok(worktree) => worktree,
        Err(err) => return (story, StoryResult::Failed(err.into())),
    };
    let registered = ctx.update(|w| {
        w.worktrees.insert(story.id.clone(), worktree.clone());
        w.story_system(&story.id, format!("Working in {} on branch {}", worktree.path, worktree.branch));
    });
    if registered.is_none() {
        return (story, StoryResult::Cancelled);
    }

    let outcome = run_attempt(&ctx, &story, Path::new(&worktree.path)).await;
    if matches!(outcome, AttemptOutcome::Cancelled) || !ctx.is_current() {
        return (story, StoryResult::Cancelled);
    }
    let success = matches!(outcome, AttemptOutcome::Succeeded);

    let finalized = {
        let _merge_guard = ctx.runtime.finalize_lock.lock().await;
        ctx.collaborators
            .worktrees
            .finalize(&ctx.repo_path, &story.id, &worktree, success)
            .await
    };
    ctx.update(|w| {
        w.worktrees.remove(&story.id);
    });
    if success && finalized.is_ok() {
        // Merged work is recorded even when a cancel landed mid-merge.
        ctx.mark_passed(&story.id).await;
    }

    let result = match (outcome, finalized) {
        (_, Err(WorktreeError::MergeConflict { branch, detail })) => StoryResult::Conflict { branch, detail },
        (AttemptOutcome::Succeeded, Ok(())) => StoryResult::Completed,
        (AttemptOutcome::Succeeded, Err(err)) => StoryResult::Failed(err.into()),
        (AttemptOutcome::Failed(err), Ok(())) => StoryResult::Failed(err),
        (AttemptOutcome::Failed(err), Err(finalize_err)) => {
            warn!(story_id = %story.id, error = %finalize_err, "Failed to discard worktree");
            StoryResult::Failed(err)
        }
        (AttemptOutcome::Cancelled, _) => StoryResult::Cancelled,
    };
    (story, result)
}

/// Picks the highest-priority ready story, if any.
fn next_ready<'a>(
    queue: &'a [Story],
    graph: &DependencyGraph,
    statuses: &HashMap<String, StoryStatus>,
    passing: &HashSet<String>,
) -> Option<&'a Story> {
    queue.iter().find(|story| graph.is_ready(&story.id, statuses, passing))
}

/// Schedules `queue` (already in priority order) until nothing is pending
/// or in progress, or until nothing pending can ever become ready.
pub(crate) async fn run_parallel(ctx: Arc<RunContext>, all_stories: Vec<Story>, queue: Vec<Story>) {
    let analysis = match ctx.collaborators.dependencies.analyze(&all_stories).await {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!(project_id = %ctx.project_id, error = %err, "Dependency analysis failed, scheduling without constraints");
            ctx.update(|w| w.system(format!("Dependency analysis failed: {}", err)));
            HashMap::new()
        }
    };
    let graph = DependencyGraph::new(all_stories.iter().map(|s| s.id.as_str()), analysis);
    let passing: HashSet<String> = all_stories
        .iter()
        .filter(|s| s.passes && !queue.iter().any(|q| q.id == s.id))
        .map(|s| s.id.clone())
        .collect();

    for cycle in graph.cycles() {
        warn!(project_id = %ctx.project_id, stories = ?cycle, "Dependency cycle detected");
        ctx.update(|w| w.system(format!("Dependency cycle between {}; these stories cannot start", cycle.join(", "))));
    }

    let mut control = ctx.control();
    let mut tasks: JoinSet<(Story, StoryResult)> = JoinSet::new();
    let mut in_flight = 0usize;

    info!(
        project_id = %ctx.project_id,
        stories = queue.len(),
        max_parallel = ctx.max_parallel,
        "Parallel build started"
    );

    loop {
        let control_now = *control.borrow_and_update();
        if control_now == Control::Cancel || !ctx.is_current() {
            // Killed agents return promptly; let their tasks observe the cancel.
            while tasks.join_next().await.is_some() {}
            return;
        }

        if control_now == Control::Proceed {
            while in_flight < ctx.max_parallel {
                let admitted = ctx.update(|w| {
                    let story = next_ready(&queue, &graph, &w.story_statuses, &passing)?.clone();
                    // Marked before the task starts so conflict checks see it.
                    w.set_story_status(&story.id, StoryStatus::InProgress);
                    Some(story)
                });
                let Some(Some(story)) = admitted else {
                    break;
                };
                debug!(project_id = %ctx.project_id, story_id = %story.id, in_flight, "Admitting story");
                tasks.spawn(execute_in_worktree(ctx.clone(), story));
                in_flight += 1;
            }
        }

        if in_flight == 0 {
            if control_now == Control::Hold {
                if control.changed().await.is_err() {
                    return;
                }
                continue;
            }
            break;
        }

        tokio::select! {
            joined = tasks.join_next() => {
                let Some(joined) = joined else {
                    in_flight = 0;
                    continue;
                };
                in_flight -= 1;
                match joined {
                    Ok((story, result)) => handle_result(&ctx, &story, result),
                    Err(err) => error!(project_id = %ctx.project_id, error = %err, "Story task panicked"),
                }
            }
            changed = control.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    if !ctx.is_current() {
        return;
    }
    report_blocked(&ctx, &queue, &graph, &passing);
    ctx.finish();
}

fn handle_result(ctx: &RunContext, story: &Story, result: StoryResult) {
    match result {
        StoryResult::Completed => {
            info!(project_id = %ctx.project_id, story_id = %story.id, "Story complete and merged");
            ctx.update(|w| {
                w.set_story_status(&story.id, StoryStatus::Complete);
                w.story_system(&story.id, format!("Story {} completed and merged", story.id));
            });
        }
        StoryResult::Failed(err) => {
            warn!(project_id = %ctx.project_id, story_id = %story.id, error = %err, "Story failed");
            ctx.update(|w| {
                w.set_story_status(&story.id, StoryStatus::Failed);
                w.story_system(&story.id, format!("Story {} failed: {}", story.id, err));
            });
        }
        StoryResult::Conflict { branch, detail } => {
            warn!(project_id = %ctx.project_id, story_id = %story.id, branch = %branch, "Merge conflict, branch preserved");
            ctx.update(|w| {
                w.set_story_status(&story.id, StoryStatus::Failed);
                w.story_system(
                    &story.id,
                    format!("Merge conflict, changes kept in branch {}: {}", branch, detail),
                );
                w.record_conflict(ConflictInfo {
                    story_id: story.id.clone(),
                    story_title: story.title.clone(),
                    branch_name: branch,
                });
            });
        }
        StoryResult::Cancelled => {}
    }
}

/// Logs every story still pending as blocked with its unmet prerequisites.
fn report_blocked(ctx: &RunContext, queue: &[Story], graph: &DependencyGraph, passing: &HashSet<String>) {
    ctx.update(|w| {
        let blocked: Vec<BuildError> = queue
            .iter()
            .filter(|story| w.story_status(&story.id) == Some(StoryStatus::Pending))
            .map(|story| BuildError::DependencyUnsatisfied {
                story_id: story.id.clone(),
                missing: graph.unsatisfied_prerequisites(&story.id, &w.story_statuses, passing),
            })
            .collect();
        for err in blocked {
            warn!(project_id = %ctx.project_id, error = %err, "Story blocked");
            w.system(err.to_string());
        }
    });
}
