use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_core::{ChatModel, ChatRequest, ChatResponse, WeftError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls including the first. Values below one mean one.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): `base_delay * 2^(retry - 1)`.
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(2u32.saturating_pow(exp))
    }
}

/// Retries rate-limited and timed-out model calls with exponential backoff.
///
/// Any other error, or the last retryable one, is returned as is.
pub struct RetryChatModel {
    inner: Arc<dyn ChatModel>,
    policy: RetryPolicy,
}

impl RetryChatModel {
    pub fn new(inner: Arc<dyn ChatModel>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ChatModel for RetryChatModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, WeftError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match self.inner.chat(request.clone()).await {
                Err(e) if e.is_retryable() && retry + 1 < attempts => {
                    retry += 1;
                    let delay = self.policy.delay_for(retry);
                    tracing::warn!(
                        retry,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
