//! Story backlog access.
//!
//! The backlog is owned outside the scheduler; the scheduler only reads a
//! snapshot at build start and records completions.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::PROJECT_DIR_NAME;
use crate::model::Story;

const PRD_FILE_NAME: &str = "prd.json";

/// Errors raised by backlog storage.
#[derive(Error, Debug)]
pub enum BacklogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No backlog found at {0}")]
    Missing(PathBuf),

    #[error("Story {0} not found in backlog")]
    UnknownStory(String),
}

/// Story backlog collaborator.
#[async_trait]
pub trait Backlog: Send + Sync {
    /// Current snapshot of every story for the repository.
    async fn load_stories(&self, repo_path: &Path) -> Result<Vec<Story>, BacklogError>;

    /// Persists `passes = true` for a completed story.
    async fn mark_passed(&self, repo_path: &Path, story_id: &str) -> Result<(), BacklogError>;
}

/// Top-level shape of `prd.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_stories: Vec<Story>,
}

/// Backlog stored in `<repo>/.ideate/prd.json`.
#[derive(Debug, Default)]
pub struct PrdBacklog {
    // Serializes read-modify-write of the PRD file.
    write_lock: Mutex<()>,
}

impl PrdBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Location of the PRD for a repository.
    pub fn prd_path(repo_path: &Path) -> PathBuf {
        repo_path.join(PROJECT_DIR_NAME).join(PRD_FILE_NAME)
    }

    fn read(path: &Path) -> Result<Value, BacklogError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BacklogError::Missing(path.to_path_buf())),
            Err(err) => Err(BacklogError::Io(err)),
        }
    }
}

#[async_trait]
impl Backlog for PrdBacklog {
    async fn load_stories(&self, repo_path: &Path) -> Result<Vec<Story>, BacklogError> {
        let path = Self::prd_path(repo_path);
        let prd: PrdFile = serde_json::from_value(Self::read(&path)?)?;
        Ok(prd.user_stories)
    }

    async fn mark_passed(&self, repo_path: &Path, story_id: &str) -> Result<(), BacklogError> {
        let path = Self::prd_path(repo_path);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Edit the raw JSON so fields this crate does not model survive.
        let mut prd = Self::read(&path)?;
        let story = prd
            .get_mut("userStories")
            .and_then(Value::as_array_mut)
            .and_then(|stories| {
                stories
                    .iter_mut()
                    .find(|s| s.get("id").and_then(Value::as_str) == Some(story_id))
            })
            .ok_or_else(|| BacklogError::UnknownStory(story_id.to_string()))?;
        if let Some(fields) = story.as_object_mut() {
            fields.insert("passes".to_string(), Value::Bool(true));
            fields.insert("status".to_string(), Value::String("complete".to_string()));
        }

        let json = serde_json::to_string_pretty(&prd)?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}
