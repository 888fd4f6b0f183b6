use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::state::MessageState;

/// A routing decision, evaluated after a node's delta has been reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Tools,
    Agent,
    End,
}

/// Where control goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Node(NodeId),
    End,
}

impl Target {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Target::Node(id) => Some(*id),
            Target::End => None,
        }
    }
}

impl From<Option<NodeId>> for Target {
    fn from(value: Option<NodeId>) -> Self {
        value.map_or(Target::End, Target::Node)
    }
}

/// The entry node of every turn.
pub const ENTRY: NodeId = NodeId::Agent;

/// The complete edge map: `(source, decision) -> target`.
pub const EDGES: [(NodeId, Route, Target); 3] = [
    (NodeId::Agent, Route::Tools, Target::Node(NodeId::Tools)),
    (NodeId::Agent, Route::End, Target::End),
    (NodeId::Tools, Route::Agent, Target::Node(NodeId::Agent)),
];

/// Look up the edge leaving `from` for `route`. `None` means the pair has no edge.
pub fn transition(from: NodeId, route: Route) -> Option<Target> {
    EDGES
        .iter()
        .find(|(source, decision, _)| *source == from && *decision == route)
        .map(|(_, _, target)| *target)
}

/// Routing after the agent: tools if the last message is an assistant message
/// carrying tool calls, otherwise end.
pub fn tools_condition(state: &MessageState) -> Route {
    match state.last_message() {
        Some(last) if last.is_assistant() && !last.tool_calls().is_empty() => Route::Tools,
        _ => Route::End,
    }
}

/// Routing decision after `node` has run. Pure in `state`.
pub fn route_after(node: NodeId, state: &MessageState) -> Route {
    match node {
        NodeId::Agent => tools_condition(state),
        NodeId::Tools => Route::Agent,
    }
}
