use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use weft_core::{ToolCall, WeftError};

use crate::ToolRegistry;

/// Executes tool calls concurrently and hands results back in call order.
#[derive(Clone, Debug)]
pub struct ParallelToolExecutor {
    registry: ToolRegistry,
    max_concurrency: usize,
    timeout: Option<Duration>,
}

impl ParallelToolExecutor {
    /// Create a new parallel tool executor backed by the given registry.
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            max_concurrency: 4,
            timeout: None,
        }
    }

    /// Upper bound on calls in flight at once. Zero is treated as one.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Per-call deadline; an expired call resolves to `WeftError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one call by name.
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, WeftError> {
        let tool = self
            .registry
            .lookup(tool_name)
            .ok_or_else(|| WeftError::ToolNotFound(tool_name.to_string()))?;

        let started = Instant::now();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.call(args)).await {
                Ok(result) => result,
                Err(_) => Err(WeftError::Timeout(format!(
                    "tool '{tool_name}' timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => tool.call(args).await,
        };
        tracing::debug!(
            tool_name = %tool_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "tool call finished"
        );
        result
    }

    /// Execute all calls with bounded concurrency.
    ///
    /// The returned vector is index-aligned with `calls` regardless of the
    /// order in which the calls complete.
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<Result<Value, WeftError>> {
        stream::iter(calls.iter().cloned())
            .map(|call| async move { self.execute(&call.name, call.arguments).await })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }
}
