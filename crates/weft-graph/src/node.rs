use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weft_core::{Message, WeftError};

use crate::state::MessageState;

/// Identifies a node in the agent graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeId {
    Agent,
    Tools,
}

impl NodeId {
    pub const ALL: [NodeId; 2] = [NodeId::Agent, NodeId::Tools];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Agent => "agent",
            NodeId::Tools => "tools",
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the graph: reads the state, proposes a delta.
///
/// Nodes never mutate the state; the engine reduces the returned messages.
#[async_trait]
pub trait Node: Send + Sync {
    async fn process(&self, state: &MessageState) -> Result<Vec<Message>, WeftError>;
}

/// Wraps an async function as a Node.
pub struct FnNode<F, Fut>
where
    F: Fn(MessageState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Message>, WeftError>> + Send,
{
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnNode<F, Fut>
where
    F: Fn(MessageState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Message>, WeftError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Node for FnNode<F, Fut>
where
    F: Fn(MessageState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Message>, WeftError>> + Send,
{
    async fn process(&self, state: &MessageState) -> Result<Vec<Message>, WeftError> {
        (self.func)(state.clone()).await
    }
}
