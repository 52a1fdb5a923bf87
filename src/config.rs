//! Build settings and global preferences.
//!
//! Global preferences are layered with the `config` crate: built-in defaults,
//! then an optional `preferences.toml`, then `STORYLOOP_*` environment
//! variables. Per-project settings live in `<repo>/.ideate/config.json` and
//! fall back to the global defaults for anything they leave out.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for preference overrides.
pub const ENV_PREFIX: &str = "STORYLOOP";

/// Directory inside a project that holds build metadata.
pub const PROJECT_DIR_NAME: &str = ".ideate";

const PROJECT_CONFIG_FILE: &str = "config.json";
const PREFERENCES_FILE: &str = "preferences.toml";

/// Default number of agents allowed to run at once in parallel mode.
pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 4;

/// Errors raised while loading settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Preferences error: {0}")]
    Preferences(#[from] config::ConfigError),

    #[error("Unknown autonomy policy '{0}'")]
    UnknownAutonomy(String),

    #[error("Unknown build mode '{0}'")]
    UnknownBuildMode(String),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),
}

/// When the scheduler stops for human review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyPolicy {
    /// Never pause except on failure.
    #[default]
    Autonomous,
    /// Pause before every story after the first.
    PauseBefore,
    /// Pause after every successful story while stories remain.
    PauseBetween,
}

impl FromStr for AutonomyPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "autonomous" | "fully-autonomous" | "full" => Ok(AutonomyPolicy::Autonomous),
            "pause-before" | "pause-before-each" | "manual" => Ok(AutonomyPolicy::PauseBefore),
            "pause-between" | "pause-between-stories" => Ok(AutonomyPolicy::PauseBetween),
            other => Err(ConfigError::UnknownAutonomy(other.to_string())),
        }
    }
}

impl fmt::Display for AutonomyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AutonomyPolicy::Autonomous => "autonomous",
            AutonomyPolicy::PauseBefore => "pause-before",
            AutonomyPolicy::PauseBetween => "pause-between",
        };
        f.write_str(label)
    }
}

/// Scheduling algorithm used for a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// One story at a time in priority order.
    #[default]
    Ralph,
    /// Bounded parallel scheduling in isolated worktrees.
    Parallel,
}

impl FromStr for BuildMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ralph" | "sequential" => Ok(BuildMode::Ralph),
            "parallel" => Ok(BuildMode::Parallel),
            other => Err(ConfigError::UnknownBuildMode(other.to_string())),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Ralph => f.write_str("ralph"),
            BuildMode::Parallel => f.write_str("parallel"),
        }
    }
}

/// Effective per-project build settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub agent: Option<String>,
    pub autonomy: AutonomyPolicy,
    pub mode: BuildMode,
}

/// User-wide preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPreferences {
    pub default_agent: Option<String>,
    pub default_autonomy: String,
    pub default_build_mode: String,
    pub max_parallel_agents: usize,
    /// Executable overrides keyed by agent id.
    pub agent_paths: HashMap<String, String>,
}

impl Default for GlobalPreferences {
    fn default() -> Self {
        Self {
            default_agent: None,
            default_autonomy: AutonomyPolicy::Autonomous.to_string(),
            default_build_mode: BuildMode::Ralph.to_string(),
            max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS,
            agent_paths: HashMap::new(),
        }
    }
}

impl GlobalPreferences {
    /// Concurrency cap for parallel builds, never below one.
    pub fn parallel_limit(&self) -> usize {
        self.max_parallel_agents.max(1)
    }
}

/// Raw shape of `<repo>/.ideate/config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectConfigFile {
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    autonomy: Option<String>,
    #[serde(default)]
    build_mode: Option<String>,
}

/// Source of build settings and preferences for the coordinator.
pub trait SettingsProvider: Send + Sync {
    fn load_build_settings(&self, repo_path: &Path) -> Result<BuildSettings, ConfigError>;
    fn load_global_preferences(&self) -> Result<GlobalPreferences, ConfigError>;
}

/// Settings read from disk.
#[derive(Debug, Clone)]
pub struct FileSettings {
    preferences_path: Option<PathBuf>,
    use_env: bool,
}

impl FileSettings {
    /// Reads preferences from the user config directory plus the environment.
    pub fn new() -> Self {
        Self {
            preferences_path: default_preferences_path(),
            use_env: true,
        }
    }

    /// Reads preferences from an explicit file, ignoring the environment.
    pub fn with_preferences_file(path: impl Into<PathBuf>) -> Self {
        Self {
            preferences_path: Some(path.into()),
            use_env: false,
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// `<config dir>/storyloop/preferences.toml`, when a config dir exists.
pub fn default_preferences_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("storyloop").join(PREFERENCES_FILE))
}

impl SettingsProvider for FileSettings {
    fn load_build_settings(&self, repo_path: &Path) -> Result<BuildSettings, ConfigError> {
        let prefs = self.load_global_preferences()?;
        let project = read_project_config(repo_path)?;
        resolve_build_settings(&prefs, project)
    }

    fn load_global_preferences(&self) -> Result<GlobalPreferences, ConfigError> {
        let defaults = GlobalPreferences::default();
        let mut builder = Config::builder()
            .set_default("default_autonomy", defaults.default_autonomy.clone())?
            .set_default("default_build_mode", defaults.default_build_mode.clone())?
            .set_default("max_parallel_agents", defaults.max_parallel_agents as i64)?;

        if let Some(path) = &self.preferences_path {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml).required(false));
        }
        if self.use_env {
            builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        }

        let prefs: GlobalPreferences = builder.build()?.try_deserialize()?;
        Ok(prefs)
    }
}

fn read_project_config(repo_path: &Path) -> Result<ProjectConfigFile, ConfigError> {
    let path = repo_path.join(PROJECT_DIR_NAME).join(PROJECT_CONFIG_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ProjectConfigFile::default()),
        Err(source) => Err(ConfigError::Io { path, source }),
    }
}

fn resolve_build_settings(
    prefs: &GlobalPreferences,
    project: ProjectConfigFile,
) -> Result<BuildSettings, ConfigError> {
    let autonomy = project
        .autonomy
        .as_deref()
        .unwrap_or(&prefs.default_autonomy)
        .parse()?;
    let mode = project
        .build_mode
        .as_deref()
        .unwrap_or(&prefs.default_build_mode)
        .parse()?;
    Ok(BuildSettings {
        agent: project.agent.or_else(|| prefs.default_agent.clone()),
        autonomy,
        mode,
    })
}

/// Fixed settings, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticSettings {
    pub settings: BuildSettings,
    pub preferences: GlobalPreferences,
}

impl StaticSettings {
    pub fn new(autonomy: AutonomyPolicy, mode: BuildMode) -> Self {
        Self {
            settings: BuildSettings {
                agent: Some("claude-code".to_string()),
                autonomy,
                mode,
            },
            preferences: GlobalPreferences::default(),
        }
    }

    pub fn with_max_parallel_agents(mut self, max: usize) -> Self {
        self.preferences.max_parallel_agents = max;
        self
    }
}

impl SettingsProvider for StaticSettings {
    fn load_build_settings(&self, _repo_path: &Path) -> Result<BuildSettings, ConfigError> {
        Ok(self.settings.clone())
    }

    fn load_global_preferences(&self) -> Result<GlobalPreferences, ConfigError> {
        Ok(self.preferences.clone())
    }
}
