use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use weft_core::{ChatModel, ChatRequest, Message, ToolDefinition, WeftError};

use crate::node::Node;
use crate::state::MessageState;

/// Calls the model with the system message, the thread transcript and the tool catalog.
///
/// The delta is exactly one assistant message. The system message is
/// prepended per call and never returned, so it never reaches stored state.
pub struct AgentNode {
    model: Arc<dyn ChatModel>,
    system: Option<Message>,
    catalog: Vec<ToolDefinition>,
    timeout: Option<Duration>,
}

impl AgentNode {
    pub fn new(model: Arc<dyn ChatModel>, catalog: Vec<ToolDefinition>) -> Self {
        Self {
            model,
            system: None,
            catalog,
            timeout: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system = Some(Message::system(prompt));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_request(&self, state: &MessageState) -> ChatRequest {
        let messages = self
            .system
            .iter()
            .chain(state.messages.iter())
            .cloned()
            .collect();
        ChatRequest::new(messages).with_tools(self.catalog.clone())
    }
}

/// Reject responses the rest of the graph cannot work with.
fn check_response(message: &Message) -> Result<(), WeftError> {
    if !message.is_assistant() {
        return Err(WeftError::ModelInvocation(format!(
            "unparsable response: expected an assistant message, got {}",
            message.role()
        )));
    }
    let mut seen = HashSet::new();
    for call in message.tool_calls() {
        if !seen.insert(call.id.as_str()) {
            return Err(WeftError::ModelInvocation(format!(
                "unparsable response: duplicate tool call id '{}'",
                call.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Node for AgentNode {
    async fn process(&self, state: &MessageState) -> Result<Vec<Message>, WeftError> {
        let request = self.build_request(state);
        let message_count = request.messages.len();
        let started = Instant::now();

        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.model.chat(request))
                .await
                .unwrap_or_else(|_| {
                    Err(WeftError::Timeout(format!(
                        "model call timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
            None => self.model.chat(request).await,
        };

        let response = result.map_err(|e| match e {
            WeftError::ModelInvocation(_) => e,
            other => WeftError::ModelInvocation(other.to_string()),
        })?;
        check_response(&response.message)?;

        tracing::debug!(
            message_count,
            tool_calls = response.message.tool_calls().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model responded"
        );
        Ok(vec![response.message])
    }
}
