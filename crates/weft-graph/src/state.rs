use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use weft_core::{Message, WeftError};

/// The transcript of one conversation thread.
///
/// Insertion order is the conversation order. The only way the engine changes
/// a state is [`MessageState::merge`] (or its by-value form [`MessageState::reduce`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub messages: Vec<Message>,
}

impl MessageState {
    pub fn new() -> Self {
        Self { messages: vec![] }
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append `delta` in order. Never reorders or deduplicates; an empty delta is a no-op.
    pub fn merge(&mut self, delta: Vec<Message>) {
        self.messages.extend(delta);
    }

    pub fn reduce(mut self, delta: Vec<Message>) -> Self {
        self.merge(delta);
        self
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Check the transcript invariants.
    ///
    /// Every tool message must answer a tool call id issued by an earlier
    /// assistant message, and system messages never live in stored state.
    pub fn validate(&self) -> Result<(), WeftError> {
        let mut issued: HashSet<&str> = HashSet::new();
        for (index, message) in self.messages.iter().enumerate() {
            match message {
                Message::System { .. } => {
                    return Err(WeftError::Graph(format!(
                        "system message stored in state at index {index}"
                    )));
                }
                Message::Assistant { tool_calls, .. } => {
                    issued.extend(tool_calls.iter().map(|c| c.id.as_str()));
                }
                Message::Tool { tool_call_id, .. } => {
                    if !issued.contains(tool_call_id.as_str()) {
                        return Err(WeftError::Graph(format!(
                            "tool message at index {index} answers unknown tool call '{tool_call_id}'"
                        )));
                    }
                }
                Message::User { .. } => {}
            }
        }
        Ok(())
    }
}
