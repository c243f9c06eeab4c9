//! Runner configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::decomposer::DecomposeLimits;
use crate::core::retry::RetryPolicy;
use crate::core::types::Mode;

/// Runner configuration (TOML).
///
/// Every bound the core enforces lives here. Missing fields fall back to the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub mode: Mode,

    /// Production runs refuse morphing unless a task is flagged `auto_morph`.
    pub production: bool,

    pub engine: EngineConfig,
    pub dispatch: DispatchConfig,
    pub learn: LearnConfig,
    pub decompose: DecomposeConfig,
    pub morph: MorphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Proposals per decision before the provider is treated as failing.
    pub max_proposal_attempts: u32,

    /// Decide/dispatch rounds a single task may use.
    pub max_steps_per_task: u32,

    /// Most recent memory records shown to the provider.
    pub memory_window: usize,

    /// Droppable prompt sections are removed past this many bytes.
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts per dispatch, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Wall-clock limit for command-backed tools and providers.
    pub tool_timeout_secs: u64,

    /// Truncate child process stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LearnConfig {
    pub enabled: bool,

    /// Times a task may re-enter `Deciding` after a failure.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecomposeConfig {
    pub max_depth: usize,
    pub max_children: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MorphConfig {
    pub max_cycles: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_proposal_attempts: 3,
            max_steps_per_task: 16,
            memory_window: 50,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            tool_timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
        }
    }
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_children: 12,
        }
    }
}

impl Default for MorphConfig {
    fn default() -> Self {
        Self { max_cycles: 3 }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Learn,
            production: false,
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
            learn: LearnConfig::default(),
            decompose: DecomposeConfig::default(),
            morph: MorphConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_proposal_attempts == 0 {
            return Err(anyhow!("engine.max_proposal_attempts must be > 0"));
        }
        if self.engine.max_steps_per_task == 0 {
            return Err(anyhow!("engine.max_steps_per_task must be > 0"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(anyhow!("dispatch.max_attempts must be > 0"));
        }
        if self.dispatch.initial_backoff_ms > self.dispatch.max_backoff_ms {
            return Err(anyhow!(
                "dispatch.initial_backoff_ms must not exceed dispatch.max_backoff_ms"
            ));
        }
        if self.dispatch.tool_timeout_secs == 0 {
            return Err(anyhow!("dispatch.tool_timeout_secs must be > 0"));
        }
        if self.dispatch.output_limit_bytes == 0 {
            return Err(anyhow!("dispatch.output_limit_bytes must be > 0"));
        }
        if self.decompose.max_children == 0 {
            return Err(anyhow!("decompose.max_children must be > 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch.max_attempts,
            initial_backoff: Duration::from_millis(self.dispatch.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.dispatch.max_backoff_ms),
        }
    }

    pub fn decompose_limits(&self) -> DecomposeLimits {
        DecomposeLimits {
            max_depth: self.decompose.max_depth,
            max_children: self.decompose.max_children,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.tool_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskmorph.toml");
        fs::write(
            &path,
            "mode = \"morph\"\nproduction = true\n\n[learn]\nmax_retries = 5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.mode, Mode::Morph);
        assert!(cfg.production);
        assert_eq!(cfg.learn.max_retries, 5);
        assert!(cfg.learn.enabled);
        assert_eq!(cfg.dispatch, DispatchConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("taskmorph.toml");
        let mut cfg = RunnerConfig::default();
        cfg.morph.max_cycles = 1;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn rejects_zero_bounds() {
        let mut cfg = RunnerConfig::default();
        cfg.dispatch.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.dispatch.initial_backoff_ms = 10_000;
        assert!(cfg.validate().is_err());
    }
}
