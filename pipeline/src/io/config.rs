//! Pipeline configuration stored under `.pipeline/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::DEFAULT_ERROR_HISTORY;
use crate::error::ConfigError;
use crate::io::sandbox::ResourceLimits;

/// Pipeline configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per plan step before giving up. Also caps any limit stated in a request.
    pub max_retries: u32,

    /// Identical consecutive errors that count as a retry loop.
    pub error_repeat_threshold: usize,

    /// Error signatures remembered per step.
    pub error_history: usize,

    /// Wall-clock budget for one sandbox run.
    pub timeout_secs: u64,

    /// Per-stream cap on captured program output.
    pub output_limit_bytes: usize,

    pub runtime: RuntimeConfig,

    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter argv; the script path is appended.
    pub command: Vec<String>,

    /// File name the script is written to in the sandbox workspace.
    pub script_name: String,

    /// Directory programs run in, shared by every step of a request. Relative
    /// paths resolve against the project root. Unset: a private directory per
    /// request, removed when the request ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string()],
            script_name: "main.py".to_string(),
            working_dir: None,
        }
    }
}

/// Language-model CLIs. Each reads the prompt on stdin and writes its answer to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub planner_command: Vec<String>,
    pub generator_command: Vec<String>,
    pub model_timeout_secs: u64,
    pub model_output_limit_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            planner_command: vec!["claude".to_string(), "-p".to_string()],
            generator_command: vec!["claude".to_string(), "-p".to_string()],
            model_timeout_secs: 5 * 60,
            model_output_limit_bytes: 200_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            error_repeat_threshold: 3,
            error_history: DEFAULT_ERROR_HISTORY,
            timeout_secs: 30,
            output_limit_bytes: 100_000,
            runtime: RuntimeConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::MaxRetries);
        }
        if self.error_repeat_threshold < 2 {
            return Err(ConfigError::RepeatThreshold(self.error_repeat_threshold));
        }
        if self.error_repeat_threshold > self.error_history {
            return Err(ConfigError::ThresholdExceedsHistory {
                threshold: self.error_repeat_threshold,
                capacity: self.error_history,
            });
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(invalid("output_limit_bytes must be > 0"));
        }
        if !is_command(&self.runtime.command) {
            return Err(invalid("runtime.command must be a non-empty array"));
        }
        if self.runtime.script_name.trim().is_empty()
            || self.runtime.script_name.contains(['/', '\\'])
        {
            return Err(invalid("runtime.script_name must be a plain file name"));
        }
        if self
            .runtime
            .working_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            return Err(invalid("runtime.working_dir must not be empty"));
        }
        if !is_command(&self.model.planner_command) {
            return Err(invalid("model.planner_command must be a non-empty array"));
        }
        if !is_command(&self.model.generator_command) {
            return Err(invalid("model.generator_command must be a non-empty array"));
        }
        if self.model.model_timeout_secs == 0 {
            return Err(invalid("model.model_timeout_secs must be > 0"));
        }
        if self.model.model_output_limit_bytes == 0 {
            return Err(invalid("model.model_output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_clock: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

fn is_command(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
