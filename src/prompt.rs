//! Agent instructions for a single story.

use std::fmt::Write;

use crate::model::Story;

/// Renders the instructions handed to the agent for `story`.
///
/// `retry_context` is appended verbatim when the story is being re-run.
pub fn build_story_prompt(story: &Story, retry_context: Option<&str>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Story {}: {}", story.id, story.title);
    prompt.push('\n');

    if !story.description.trim().is_empty() {
        let _ = writeln!(prompt, "{}", story.description.trim());
        prompt.push('\n');
    }

    if !story.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n\n");
        for criterion in &story.acceptance_criteria {
            let _ = writeln!(prompt, "- {}", criterion);
        }
        prompt.push('\n');
    }

    if !story.notes.trim().is_empty() {
        prompt.push_str("## Notes\n\n");
        let _ = writeln!(prompt, "{}", story.notes.trim());
        prompt.push('\n');
    }

    prompt.push_str(
        "## Instructions\n\n\
         Implement only this story. Make sure every acceptance criterion is met, \
         run the project's checks, and leave the working tree in a buildable state.\n",
    );

    if let Some(context) = retry_context {
        prompt.push('\n');
        prompt.push_str(context);
        prompt.push('\n');
    }

    prompt
}
