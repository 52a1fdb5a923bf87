//! Persisted record of finished agent attempts.
//!
//! Each attempt gets a plain-text log file under `.ideate/logs/` and an entry
//! in `.ideate/process-history.json`, most recent first.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PROJECT_DIR_NAME;
use crate::model::LogEntry;

const LOGS_DIR_NAME: &str = "logs";
const HISTORY_FILE_NAME: &str = "process-history.json";
const HEADER_RULE: &str = "========================================";

/// Oldest entries beyond this are dropped.
pub const MAX_HISTORY_ENTRIES: usize = 500;

// Stores are created per attempt, so the read-modify-write lock is global.
static HISTORY_LOCK: Mutex<()> = Mutex::new(());
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Keeps alphanumerics, `-` and `_`; anything else becomes `_`.
fn file_safe(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Errors that can occur while persisting process history.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// One finished agent attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub process_id: String,
    pub project_id: String,
    pub process_type: String,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub success: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl ProcessRecord {
    /// Record for a story attempt that ran from `started_at` until now.
    pub fn story_attempt(
        process_id: impl Into<String>,
        project_id: impl Into<String>,
        story_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            process_id: process_id.into(),
            project_id: project_id.into(),
            process_type: "story".to_string(),
            label: story_id.into(),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            exit_code: None,
            success: false,
            agent_id: None,
            log_file_path: None,
        }
    }

    pub fn with_exit(mut self, exit_code: Option<i32>, success: bool) -> Self {
        self.exit_code = exit_code;
        self.success = success;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessHistory {
    entries: Vec<ProcessRecord>,
}

/// Process history rooted at a repository's `.ideate` directory.
#[derive(Debug, Clone)]
pub struct ProcessHistoryStore {
    root_dir: PathBuf,
}

impl ProcessHistoryStore {
    pub fn for_repo(repo_path: &Path) -> Self {
        Self {
            root_dir: repo_path.join(PROJECT_DIR_NAME),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Writes the attempt's log file and prepends its history entry.
    pub fn record(&self, mut record: ProcessRecord, logs: &[LogEntry]) -> HistoryResult<PathBuf> {
        let log_path = self.write_log(&record, logs)?;
        record.log_file_path = Some(log_path.to_string_lossy().to_string());
        self.append(record)?;
        Ok(log_path)
    }

    /// Writes a log file with a header block and one line per entry.
    pub fn write_log(&self, record: &ProcessRecord, logs: &[LogEntry]) -> HistoryResult<PathBuf> {
        let logs_dir = self.root_dir.join(LOGS_DIR_NAME);
        fs::create_dir_all(&logs_dir)?;

        // The full process id keeps attempts finishing in the same second apart.
        let filename = format!(
            "{}_{}_{}_{}.log",
            record.completed_at.format("%Y%m%d_%H%M%S"),
            record.process_type,
            file_safe(&record.label),
            file_safe(&record.process_id)
        );
        let log_path = logs_dir.join(filename);

        let mut file = fs::File::create(&log_path)?;
        writeln!(file, "{}", HEADER_RULE)?;
        writeln!(file, "Process Log")?;
        writeln!(file, "{}", HEADER_RULE)?;
        writeln!(file, "Process ID: {}", record.process_id)?;
        writeln!(file, "Project ID: {}", record.project_id)?;
        writeln!(file, "Type: {}", record.process_type)?;
        writeln!(file, "Label: {}", record.label)?;
        writeln!(file, "Created: {}", Utc::now().to_rfc3339())?;
        writeln!(file, "{}", HEADER_RULE)?;
        writeln!(file)?;

        for entry in logs {
            writeln!(
                file,
                "[{}] {} {}",
                entry.timestamp.to_rfc3339(),
                entry.channel.file_prefix(),
                entry.text
            )?;
        }
        file.sync_all()?;

        Ok(log_path)
    }

    /// Prepends an entry, keeping at most [`MAX_HISTORY_ENTRIES`].
    pub fn append(&self, record: ProcessRecord) -> HistoryResult<()> {
        let _guard = HISTORY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.root_dir)?;
        let mut history = self.read_history()?;
        history.entries.insert(0, record);
        history.entries.truncate(MAX_HISTORY_ENTRIES);
        self.write_history(&history)
    }

    /// Entries for one project, most recent first.
    pub fn load(&self, project_id: &str) -> HistoryResult<Vec<ProcessRecord>> {
        Ok(self
            .read_history()?
            .entries
            .into_iter()
            .filter(|entry| entry.project_id == project_id)
            .collect())
    }

    fn read_history(&self) -> HistoryResult<ProcessHistory> {
        match fs::read_to_string(self.root_dir.join(HISTORY_FILE_NAME)) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ProcessHistory::default()),
            Err(err) => Err(HistoryError::Io(err)),
        }
    }

    fn write_history(&self, history: &ProcessHistory) -> HistoryResult<()> {
        let json = serde_json::to_string_pretty(history)?;
        let temp_path = self.root_dir.join(format!(
            "{}.{}-{}.tmp",
            HISTORY_FILE_NAME,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let history_path = self.root_dir.join(HISTORY_FILE_NAME);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &history_path)?;

        Ok(())
    }
}
