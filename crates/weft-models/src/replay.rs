use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use weft_core::{ChatModel, ChatRequest, ChatResponse, Message, WeftError};

/// A model that answers from a transcript script.
///
/// Response `n` is returned when the request already holds `n` assistant
/// messages, so a fresh process resuming a thread picks up where the script
/// left off instead of starting over.
#[derive(Clone)]
pub struct ReplayChatModel {
    script: Arc<[Message]>,
}

impl ReplayChatModel {
    pub fn new(script: Vec<Message>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Load a script: a JSON array of assistant messages, one per model turn
    /// across the whole thread.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, WeftError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WeftError::Config(format!("read script {}: {e}", path.display())))?;
        let script: Vec<Message> = serde_json::from_str(&text)
            .map_err(|e| WeftError::Config(format!("parse script {}: {e}", path.display())))?;
        if let Some(index) = script.iter().position(|m| !m.is_assistant()) {
            return Err(WeftError::Config(format!(
                "script {} entry {index} is not an assistant message",
                path.display()
            )));
        }
        Ok(Self::new(script))
    }

    pub fn len(&self) -> usize {
        self.script.len()
    }

    pub fn is_empty(&self) -> bool {
        self.script.is_empty()
    }
}

#[async_trait]
impl ChatModel for ReplayChatModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, WeftError> {
        let turn = request
            .messages
            .iter()
            .filter(|m| m.is_assistant())
            .count();
        tracing::debug!(turn, script_len = self.script.len(), "replaying scripted turn");
        self.script
            .get(turn)
            .cloned()
            .map(ChatResponse::new)
            .ok_or_else(|| {
                WeftError::ModelInvocation(format!("script has no response for model turn {turn}"))
            })
    }
}
