//! # storyloop
//!
//! Drives coding-agent processes through a prioritized backlog of stories.
//!
//! A [`BuildCoordinator`] runs one build per project, either one story at a
//! time in the repository itself (Ralph mode) or several stories at once,
//! each in its own git worktree, bounded by `max_parallel_agents`. Failed
//! stories are retried with the tail of their previous output; worktree
//! merges that conflict keep their branch for a [`ConflictSession`] to
//! resolve file by file.

pub mod agents;
pub mod backlog;
pub mod build;
pub mod config;
pub mod conflict;
pub mod dependency;
pub mod error;
pub mod history;
pub mod logging;
pub mod model;
pub mod prompt;
pub mod retry;
pub mod runner;
pub mod worktree;

pub use build::{BuildCoordinator, BuildEvent, BuildRequest, BuildState, BuildSummary, Collaborators};
pub use config::{AutonomyPolicy, BuildMode};
pub use conflict::{ConflictPhase, ConflictSession};
pub use error::{BuildError, BuildResult};
pub use model::{BuildStatus, Story, StoryStatus};
pub use worktree::ResolutionStrategy;
