use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the tool node does with a failed tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolErrorPolicy {
    /// Turn the failure into an error tool message the model sees next turn.
    #[default]
    Report,
    /// Fail the step with `WeftError::ToolInvocation`.
    Abort,
}

/// Engine settings. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum tool dispatches per turn before the run fails.
    pub max_round_trips: usize,
    #[serde(with = "duration_secs")]
    pub model_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub tool_timeout: Duration,
    pub tool_error_policy: ToolErrorPolicy,
    pub max_tool_concurrency: usize,
    /// Prepended to every model call; never stored in thread state.
    pub system_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_round_trips: 10,
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            tool_error_policy: ToolErrorPolicy::Report,
            max_tool_concurrency: 4,
            system_prompt: None,
        }
    }
}

impl EngineConfig {
    pub fn with_max_round_trips(mut self, max: usize) -> Self {
        self.max_round_trips = max;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_tool_error_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.tool_error_policy = policy;
        self
    }

    pub fn with_max_tool_concurrency(mut self, max: usize) -> Self {
        self.max_tool_concurrency = max;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Durations as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
