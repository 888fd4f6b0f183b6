mod parallel_executor;

use std::collections::HashMap;
use std::sync::Arc;

use weft_core::{Tool, ToolDefinition, WeftError};

pub use parallel_executor::ParallelToolExecutor;

/// Name-indexed set of tools, fixed at construction.
///
/// The map is built once and shared behind an `Arc`, so clones are cheap and
/// lookups never scan.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Build a registry from `tools`. Two tools sharing a name is a configuration error.
    pub fn new(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Result<Self, WeftError> {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if map.contains_key(&name) {
                return Err(WeftError::Config(format!(
                    "duplicate tool name '{name}'"
                )));
            }
            map.insert(name, tool);
        }
        Ok(Self {
            tools: Arc::new(map),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool declarations for the model, sorted by name so requests are deterministic.
    pub fn catalog(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.as_tool_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
