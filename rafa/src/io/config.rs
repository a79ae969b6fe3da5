//! Project configuration stored under `.rafa/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Rafa configuration (TOML).
///
/// Missing fields default so an empty or absent file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RafaConfig {
    /// Per-attempt wall-clock limit for the agent process; 0 disables it.
    pub attempt_timeout_secs: u64,

    /// Capacity of the live output event channel.
    pub event_channel_capacity: usize,

    /// Skip the clean-workspace check and all commits.
    pub allow_dirty: bool,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to execute (e.g. `"claude"`).
    pub command: String,
    /// Arguments passed before the prompt is piped on stdin.
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: [
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--dangerously-skip-permissions",
            ]
            .iter()
            .map(|arg| arg.to_string())
            .collect(),
        }
    }
}

impl Default for RafaConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 60 * 60,
            event_channel_capacity: 256,
            allow_dirty: false,
            agent: AgentConfig::default(),
        }
    }
}

impl RafaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(anyhow!("event_channel_capacity must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_secs > 0).then(|| Duration::from_secs(self.attempt_timeout_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RafaConfig::default()`.
pub fn load_config(path: &Path) -> Result<RafaConfig> {
    if !path.exists() {
        let cfg = RafaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RafaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RafaConfig) -> Result<()> {
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
