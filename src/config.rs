use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::evaluation::{AcceptanceStage, Cascade, CommandStage, CompletionStage};
use crate::merge::MergePolicy;
use crate::scoring::ScoreWeights;
use crate::{Error, Result};

pub const CONFIG_FILE: &str = "conductor.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub concurrency: usize,
    pub task_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    pub max_debug_retries: u32,
    pub branch_prefix: String,
    /// Branch that verified work is integrated into. Defaults to the
    /// repository's current branch.
    pub target_branch: Option<String>,
    pub worktree_dir: Option<String>,
    pub state_dir: Option<String>,
    pub merge: MergePolicy,
    pub scoring: ScoringConfig,
    pub executor: ExecutorConfig,
    pub stages: Vec<StageConfig>,
    /// Run each task's acceptance criteria as shell commands.
    pub acceptance_commands: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    #[serde(flatten)]
    pub weights: ScoreWeights,
    pub complexity_budget_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 2,
            task_timeout_secs: 1800,
            stage_timeout_secs: 600,
            max_debug_retries: 2,
            branch_prefix: "conductor/task/".to_string(),
            target_branch: None,
            worktree_dir: None,
            state_dir: None,
            merge: MergePolicy::default(),
            scoring: ScoringConfig::default(),
            executor: ExecutorConfig::default(),
            stages: Vec::new(),
            acceptance_commands: true,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            complexity_budget_lines: 400,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "claude -p".to_string(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location. A missing file
    /// yields defaults; an invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::parse(&fs::read_to_string(&path)?)?;
        tracing::debug!(
            concurrency = config.concurrency,
            threshold = config.merge.threshold,
            stages = config.stages.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".into()));
        }
        if self.task_timeout_secs == 0 || self.stage_timeout_secs == 0 {
            return Err(Error::Validation("timeouts must be at least 1 second".into()));
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(Error::Validation("branch_prefix must not be empty".into()));
        }
        if self.executor.command.trim().is_empty() {
            return Err(Error::Validation("executor command must not be empty".into()));
        }
        for stage in &self.stages {
            if stage.name.trim().is_empty() || stage.command.trim().is_empty() {
                return Err(Error::Validation(
                    "every [[stages]] entry needs a name and a command".into(),
                ));
            }
        }
        self.merge.validate()?;
        self.scoring.weights.validate()?;
        Ok(())
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::conductor_dir(),
        }
    }

    pub fn worktree_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("worktrees")),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Completion check first, then the configured command stages in
    /// order, then the acceptance criteria.
    pub fn cascade(&self) -> Cascade {
        let mut cascade = Cascade::new(self.stage_timeout()).with_stage(Arc::new(CompletionStage));
        for stage in &self.stages {
            cascade.push(Arc::new(CommandStage::new(&stage.name, &stage.command)));
        }
        if self.acceptance_commands {
            cascade.push(Arc::new(AcceptanceStage));
        }
        cascade
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.state_dir()?)?;
        fs::create_dir_all(self.worktree_dir()?)?;
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
