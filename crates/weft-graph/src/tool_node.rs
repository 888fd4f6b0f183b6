use async_trait::async_trait;
use serde_json::Value;
use weft_core::{Message, WeftError};
use weft_tools::ParallelToolExecutor;

use crate::config::ToolErrorPolicy;
use crate::node::Node;
use crate::state::MessageState;

/// Executes the tool calls of the last assistant message.
///
/// Calls may run concurrently, but the delta holds one tool message per call
/// in the order the calls were issued.
pub struct ToolNode {
    executor: ParallelToolExecutor,
    policy: ToolErrorPolicy,
}

impl ToolNode {
    pub fn new(executor: ParallelToolExecutor) -> Self {
        Self {
            executor,
            policy: ToolErrorPolicy::Report,
        }
    }

    pub fn with_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Tool output as message content: JSON strings verbatim, anything else serialized.
fn render(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl Node for ToolNode {
    async fn process(&self, state: &MessageState) -> Result<Vec<Message>, WeftError> {
        let last = state
            .last_message()
            .ok_or_else(|| WeftError::Graph("no messages in state".to_string()))?;
        if !last.is_assistant() {
            return Err(WeftError::Graph(format!(
                "tool node expects an assistant message last, found {}",
                last.role()
            )));
        }

        let calls = last.tool_calls();
        let results = self.executor.execute_all(calls).await;

        let mut delta = Vec::with_capacity(calls.len());
        for (call, result) in calls.iter().zip(results) {
            match result {
                Ok(value) => delta.push(Message::tool(render(value), &call.id)),
                Err(err) => match self.policy {
                    ToolErrorPolicy::Report => {
                        tracing::warn!(
                            tool_name = %call.name,
                            tool_call_id = %call.id,
                            error = %err,
                            "tool call failed, reporting to model"
                        );
                        delta.push(Message::tool_error(err.to_string(), &call.id));
                    }
                    ToolErrorPolicy::Abort => {
                        return Err(match err {
                            WeftError::ToolInvocation { .. } | WeftError::ToolNotFound(_) => err,
                            other => WeftError::tool(&call.name, other.to_string()),
                        });
                    }
                },
            }
        }
        Ok(delta)
    }
}
