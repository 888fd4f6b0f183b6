use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use weft_core::WeftError;

use crate::node::NodeId;
use crate::state::MessageState;

/// Configuration identifying a checkpoint lineage (one conversation thread).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
        }
    }
}

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// The user message that opened a turn.
    Input,
    Agent,
    Tools,
}

impl From<NodeId> for CheckpointSource {
    fn from(node: NodeId) -> Self {
        match node {
            NodeId::Agent => CheckpointSource::Agent,
            NodeId::Tools => CheckpointSource::Tools,
        }
    }
}

/// A snapshot of a thread taken after a step has been reduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic per thread.
    pub step: u64,
    pub source: CheckpointSource,
    pub state: MessageState,
    /// The node to run next; `None` once the thread reached the end.
    pub next: Option<NodeId>,
    /// Tool dispatches performed in the current turn.
    #[serde(default)]
    pub round_trips: usize,
}

impl Checkpoint {
    pub fn is_pending(&self) -> bool {
        self.next.is_some()
    }
}

/// Durable storage for thread checkpoints.
///
/// `put` must not return before the write is acknowledged; the engine does not
/// advance past a step until it has.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn put(&self, config: &CheckpointConfig, checkpoint: &Checkpoint)
        -> Result<(), WeftError>;

    /// The most recent checkpoint of the thread.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>, WeftError>;

    /// All checkpoints of the thread, oldest first.
    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>, WeftError>;

    /// Drop every checkpoint of the thread.
    async fn delete(&self, config: &CheckpointConfig) -> Result<(), WeftError>;
}

/// In-memory checkpointer for single-process, non-durable use and tests.
#[derive(Default)]
pub struct MemorySaver {
    store: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemorySaver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemorySaver {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
    ) -> Result<(), WeftError> {
        let mut store = self.store.write().await;
        store
            .entry(config.thread_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>, WeftError> {
        let store = self.store.read().await;
        Ok(store.get(&config.thread_id).and_then(|v| v.last().cloned()))
    }

    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>, WeftError> {
        let store = self.store.read().await;
        Ok(store.get(&config.thread_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, config: &CheckpointConfig) -> Result<(), WeftError> {
        self.store.write().await.remove(&config.thread_id);
        Ok(())
    }
}
