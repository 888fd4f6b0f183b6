mod agent_node;
mod checkpoint;
mod config;
mod engine;
mod node;
mod router;
mod state;
mod tool_node;
mod visualization;

pub use agent_node::AgentNode;
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointSource, Checkpointer, MemorySaver};
pub use config::{EngineConfig, ToolErrorPolicy};
pub use engine::{GraphEngine, GraphEngineBuilder, GraphEvent, GraphStream};
pub use node::{FnNode, Node, NodeId};
pub use router::{route_after, tools_condition, transition, Route, Target, EDGES, ENTRY};
pub use state::MessageState;
pub use tool_node::ToolNode;
pub use visualization::{draw_ascii, draw_mermaid};
