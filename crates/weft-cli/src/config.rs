use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use std::time::Duration;

use serde::Deserialize;
use weft_graph::EngineConfig;
use weft_models::RetryPolicy;

use crate::fixture::FixtureDef;

pub const DEFAULT_CONFIG_FILE: &str = "weft.toml";
pub const DEFAULT_DB_FILE: &str = "weft.db";

/// Contents of `weft.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub checkpoint: CheckpointSettings,
    pub tools: Vec<FixtureDef>,
    /// JSON file of assistant messages replayed by the scripted model.
    pub script: Option<PathBuf>,
    /// Retry rate-limited and timed-out model calls when present.
    pub retry: Option<RetrySettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub path: PathBuf,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_FILE),
        }
    }
}

impl CliConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid weft config")
    }

    /// Load `path` if given, otherwise `weft.toml` in the working directory
    /// when present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !required && !path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let mut config = Self::parse(&text)
            .with_context(|| format!("failed to load config at {}", path.display()))?;

        // Relative paths in the file are relative to the file itself.
        if let Some(dir) = path.parent() {
            config.script = config.script.map(|s| dir.join(s));
            if config.checkpoint.path.is_relative() {
                config.checkpoint.path = dir.join(&config.checkpoint.path);
            }
        }
        Ok(config)
    }
}
