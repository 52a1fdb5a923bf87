//! Ralph mode: one story at a time in priority order.

use tracing::{info, warn};

use super::run::{run_attempt, wait_for_proceed, AttemptOutcome, RunContext};
use super::state::Control;
use crate::config::AutonomyPolicy;
use crate::model::{Story, StoryStatus};

/// Runs `queue` in order, pausing according to the autonomy policy.
///
/// A failed story always pauses the build; resuming re-runs the same story
/// with the failure context of its previous attempt.
pub(crate) async fn run_sequential(ctx: &RunContext, queue: Vec<Story>) {
    let mut control = ctx.control();
    let mut index = 0;
    // Set after any pause ahead of the current story so one resume runs it.
    let mut resumed_here = false;

    while index < queue.len() {
        if !wait_for_proceed(&mut control).await || !ctx.is_current() {
            return;
        }

        let story = &queue[index];
        if index > 0 && ctx.autonomy == AutonomyPolicy::PauseBefore && !resumed_here {
            ctx.update(|w| {
                w.set_story_status(&story.id, StoryStatus::Pending);
                w.current_story_id = Some(story.id.clone());
            });
            ctx.pause(format!("Paused before story {}: {}", story.id, story.title));
            resumed_here = true;
            continue;
        }
        resumed_here = false;

        match run_attempt(ctx, story, &ctx.repo_path).await {
            AttemptOutcome::Cancelled => return,
            AttemptOutcome::Succeeded => {
                // An operator pause during this story already holds the next one.
                resumed_here = *control.borrow() == Control::Hold;
                info!(project_id = %ctx.project_id, story_id = %story.id, "Story complete");
                let still_current = ctx.update(|w| {
                    w.set_story_status(&story.id, StoryStatus::Complete);
                    w.story_system(&story.id, format!("Story {} completed", story.id));
                });
                if still_current.is_none() {
                    return;
                }
                ctx.mark_passed(&story.id).await;
                index += 1;

                if ctx.autonomy == AutonomyPolicy::PauseBetween {
                    if let Some(next) = queue.get(index) {
                        ctx.update(|w| w.set_story_status(&next.id, StoryStatus::Pending));
                        ctx.pause(format!("Story {} complete, paused before {}", story.id, next.id));
                        resumed_here = true;
                    }
                }
            }
            AttemptOutcome::Failed(err) => {
                warn!(project_id = %ctx.project_id, story_id = %story.id, error = %err, "Story failed");
                ctx.update(|w| {
                    w.set_story_status(&story.id, StoryStatus::Failed);
                    w.story_system(&story.id, format!("Story {} failed: {}", story.id, err));
                });
                ctx.pause(format!("Paused after story {} failed; resume to retry", story.id));
                resumed_here = true;
            }
        }
    }

    if ctx.is_current() {
        ctx.finish();
    }
}
