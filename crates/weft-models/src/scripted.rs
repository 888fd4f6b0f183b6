use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use weft_core::{ChatModel, ChatRequest, ChatResponse, Message, WeftError};

/// A deterministic model that replays a fixed list of responses in order.
///
/// Every request is recorded so tests can assert on what the model was shown.
#[derive(Clone)]
pub struct ScriptedChatModel {
    responses: Arc<Mutex<VecDeque<ChatResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedChatModel {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(ChatResponse::new).collect())
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, WeftError> {
        self.requests.lock().await.push(request);
        let mut responses = self.responses.lock().await;
        responses.pop_front().ok_or_else(|| {
            WeftError::ModelInvocation("scripted model exhausted responses".to_string())
        })
    }
}
