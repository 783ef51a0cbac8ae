//! Layered configuration for the Orchestra engine.
//!
//! Merge order, lowest to highest: hard-coded defaults, the workspace
//! `.orchestrarc.json`, environment variables, then call-site overrides.
//! The resolved document is snapshotted into every session so a resumed
//! run sees the options it started with.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Workspace-relative directory holding all session state.
pub const ORCHESTRA_DIR: &str = ".orchestra";

/// Config file searched in the workspace root.
pub const CONFIG_FILE: &str = ".orchestrarc.json";

/// Hard cap on `execution.maxIterations` regardless of configuration.
pub const MAX_ITERATIONS_CAP: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Run the file scheduler with more than one worker
    pub parallel: bool,
    /// Worker cap for the file scheduler
    pub max_concurrency: usize,
    /// Inner-loop cap for executing/auditing iterations
    pub max_iterations: u32,
    /// Per-adapter deadline in milliseconds
    pub timeout: u64,
    /// Overlap per-file audits with ongoing generation
    pub pipeline: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_concurrency: 3,
            max_iterations: 3,
            timeout: 600_000,
            pipeline: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Override for detected test framework command
    pub command: Option<String>,
    /// Require tests to pass before COMPLETED
    pub run_after_generation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitConfig {
    pub auto_commit: bool,
    /// Template with a `{task}` placeholder
    pub commit_message_template: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            commit_message_template: "feat: {task}".to_string(),
        }
    }
}

/// Recovery and collaborator-facing knobs. The section is named `tui` in
/// the config file for compatibility with the control-plane collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuiConfig {
    pub max_recovery_attempts: u32,
    pub recovery_timeout_minutes: u64,
    pub auto_revert_on_failure: bool,
    pub cache_enabled: bool,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            recovery_timeout_minutes: 10,
            auto_revert_on_failure: false,
            cache_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Disabled,
    #[default]
    Shadow,
    AbTest,
    Production,
}

impl LearningMode {
    /// Whether experiences are collected at all.
    pub fn collects(&self) -> bool {
        !matches!(self, LearningMode::Disabled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" => Some(LearningMode::Disabled),
            "shadow" => Some(LearningMode::Shadow),
            "ab_test" => Some(LearningMode::AbTest),
            "production" => Some(LearningMode::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LearningConfig {
    pub mode: LearningMode,
}

/// The fully resolved configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestraConfig {
    pub execution: ExecutionConfig,
    pub test: TestConfig,
    pub git: GitConfig,
    pub tui: TuiConfig,
    pub learning: LearningConfig,

    /// Workspace root everything else hangs off
    pub workspace_dir: PathBuf,
    /// Injectable experience-buffer location (tests point this at a tempdir)
    pub data_dir: Option<PathBuf>,
    /// Injectable rate-ledger location
    pub rate_ledger_path: Option<PathBuf>,
    /// Soft wall clock for one session, minutes
    pub session_wall_clock_minutes: u64,
    /// Consultant deadline in milliseconds (shorter than the general one)
    pub consultant_timeout: u64,
    /// Cleared by `--no-audit`
    pub audit_enabled: bool,
}

impl Default for OrchestraConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            test: TestConfig::default(),
            git: GitConfig::default(),
            tui: TuiConfig::default(),
            learning: LearningConfig::default(),
            workspace_dir: PathBuf::from("."),
            data_dir: None,
            rate_ledger_path: None,
            session_wall_clock_minutes: 30,
            consultant_timeout: 300_000,
            audit_enabled: true,
        }
    }
}

/// Call-site overrides, highest precedence in the merge.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub parallel: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub max_iterations: Option<u32>,
    pub timeout: Option<u64>,
    pub pipeline: Option<bool>,
    pub audit_enabled: Option<bool>,
    pub auto_revert_on_failure: Option<bool>,
    pub max_recovery_attempts: Option<u32>,
    pub learning_mode: Option<LearningMode>,
    pub data_dir: Option<PathBuf>,
    pub rate_ledger_path: Option<PathBuf>,
}

impl OrchestraConfig {
    /// Resolve the configuration for a workspace.
    pub fn resolve(workspace_dir: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::load_file(workspace_dir)?.unwrap_or_default();
        config.workspace_dir = workspace_dir.to_path_buf();
        config.apply_env();
        config.apply_overrides(overrides);
        config.clamp();
        Ok(config)
    }

    fn load_file(workspace_dir: &Path) -> Result<Option<Self>> {
        let path = workspace_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(Some(config))
    }

    fn apply_env(&mut self) {
        if let Ok(mode) = std::env::var("LEARNING_MODE")
            && let Some(parsed) = LearningMode::parse(&mode)
        {
            self.learning.mode = parsed;
        }
        if let Ok(v) = std::env::var("ORCHESTRA_MAX_ITERATIONS")
            && let Ok(n) = v.parse()
        {
            self.execution.max_iterations = n;
        }
        if let Ok(v) = std::env::var("ORCHESTRA_MAX_CONCURRENCY")
            && let Ok(n) = v.parse()
        {
            self.execution.max_concurrency = n;
        }
        if let Ok(v) = std::env::var("ORCHESTRA_TIMEOUT")
            && let Ok(n) = v.parse()
        {
            self.execution.timeout = n;
        }
        if let Ok(v) = std::env::var("ORCHESTRA_TEST_COMMAND")
            && !v.is_empty()
        {
            self.test.command = Some(v);
        }
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = overrides.parallel {
            self.execution.parallel = v;
        }
        if let Some(v) = overrides.max_concurrency {
            self.execution.max_concurrency = v;
        }
        if let Some(v) = overrides.max_iterations {
            self.execution.max_iterations = v;
        }
        if let Some(v) = overrides.timeout {
            self.execution.timeout = v;
        }
        if let Some(v) = overrides.pipeline {
            self.execution.pipeline = v;
        }
        if let Some(v) = overrides.audit_enabled {
            self.audit_enabled = v;
        }
        if let Some(v) = overrides.auto_revert_on_failure {
            self.tui.auto_revert_on_failure = v;
        }
        if let Some(v) = overrides.max_recovery_attempts {
            self.tui.max_recovery_attempts = v;
        }
        if let Some(v) = overrides.learning_mode {
            self.learning.mode = v;
        }
        if let Some(ref v) = overrides.data_dir {
            self.data_dir = Some(v.clone());
        }
        if let Some(ref v) = overrides.rate_ledger_path {
            self.rate_ledger_path = Some(v.clone());
        }
    }

    fn clamp(&mut self) {
        self.execution.max_iterations = self.execution.max_iterations.clamp(1, MAX_ITERATIONS_CAP);
        self.execution.max_concurrency = self.execution.max_concurrency.max(1);
    }

    /// Effective worker count for the file scheduler.
    pub fn concurrency(&self) -> usize {
        if self.execution.parallel {
            self.execution.max_concurrency
        } else {
            1
        }
    }

    pub fn orchestra_dir(&self) -> PathBuf {
        self.workspace_dir.join(ORCHESTRA_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.orchestra_dir().join("cache")
    }

    pub fn rate_limits_path(&self) -> PathBuf {
        self.rate_ledger_path
            .clone()
            .unwrap_or_else(|| self.orchestra_dir().join("rate-limits.json"))
    }

    pub fn experience_path(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("data").join("experience_buffer"))
            .join("experiences.jsonl")
    }

    /// Write a default `.orchestrarc.json` for the `init` command.
    pub fn write_default(workspace_dir: &Path) -> Result<PathBuf> {
        let path = workspace_dir.join(CONFIG_FILE);
        let defaults = Self::default();
        let content = serde_json::to_string_pretty(&defaults)
            .context("Failed to serialize default config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestraConfig::default();
        assert!(!config.execution.parallel);
        assert_eq!(config.execution.max_concurrency, 3);
        assert_eq!(config.execution.max_iterations, 3);
        assert_eq!(config.execution.timeout, 600_000);
        assert_eq!(config.tui.max_recovery_attempts, 3);
        assert_eq!(config.git.commit_message_template, "feat: {task}");
        assert_eq!(config.learning.mode, LearningMode::Shadow);
        assert!(config.audit_enabled);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"execution": {"maxConcurrency": 5, "pipeline": true}, "git": {"autoCommit": true}}"#,
        )
        .unwrap();

        let config = OrchestraConfig::resolve(dir.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.execution.max_concurrency, 5);
        assert!(config.execution.pipeline);
        assert!(config.git.auto_commit);
        // untouched keys stay default
        assert_eq!(config.execution.max_iterations, 3);
    }

    #[test]
    fn overrides_beat_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"execution": {"maxIterations": 5}}"#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            max_iterations: Some(2),
            ..Default::default()
        };
        let config = OrchestraConfig::resolve(dir.path(), &overrides).unwrap();
        assert_eq!(config.execution.max_iterations, 2);
    }

    #[test]
    fn max_iterations_is_hard_capped() {
        let dir = tempdir().unwrap();
        let overrides = ConfigOverrides {
            max_iterations: Some(50),
            ..Default::default()
        };
        let config = OrchestraConfig::resolve(dir.path(), &overrides).unwrap();
        assert_eq!(config.execution.max_iterations, MAX_ITERATIONS_CAP);
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        let result = OrchestraConfig::resolve(dir.path(), &ConfigOverrides::default());
        assert!(result.is_err());
    }

    #[test]
    fn concurrency_collapses_to_one_without_parallel() {
        let mut config = OrchestraConfig::default();
        assert_eq!(config.concurrency(), 1);
        config.execution.parallel = true;
        assert_eq!(config.concurrency(), 3);
    }

    #[test]
    fn learning_mode_parses_all_variants() {
        assert_eq!(LearningMode::parse("disabled"), Some(LearningMode::Disabled));
        assert_eq!(LearningMode::parse("SHADOW"), Some(LearningMode::Shadow));
        assert_eq!(LearningMode::parse("ab_test"), Some(LearningMode::AbTest));
        assert_eq!(LearningMode::parse("production"), Some(LearningMode::Production));
        assert_eq!(LearningMode::parse("bogus"), None);
        assert!(!LearningMode::Disabled.collects());
        assert!(LearningMode::Shadow.collects());
    }

    #[test]
    fn write_default_round_trips() {
        let dir = tempdir().unwrap();
        let path = OrchestraConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());
        let config = OrchestraConfig::resolve(dir.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.execution.max_concurrency, 3);
    }

    #[test]
    fn injected_paths_take_precedence() {
        let dir = tempdir().unwrap();
        let overrides = ConfigOverrides {
            data_dir: Some(dir.path().join("xp")),
            rate_ledger_path: Some(dir.path().join("ledger.json")),
            ..Default::default()
        };
        let config = OrchestraConfig::resolve(dir.path(), &overrides).unwrap();
        assert_eq!(config.experience_path(), dir.path().join("xp/experiences.jsonl"));
        assert_eq!(config.rate_limits_path(), dir.path().join("ledger.json"));
    }
}
