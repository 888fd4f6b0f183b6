use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use weft_core::{Tool, WeftError};

/// A config-declared tool: looks up one string argument in a fixed table.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Name of the argument used as the lookup key.
    pub key: String,
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
}

pub struct FixtureTool {
    def: FixtureDef,
}

impl FixtureTool {
    pub fn new(def: FixtureDef) -> Self {
        Self { def }
    }
}

#[async_trait]
impl Tool for FixtureTool {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { (self.def.key.clone()): { "type": "string" } },
            "required": [self.def.key],
        }))
    }

    async fn call(&self, args: Value) -> Result<Value, WeftError> {
        let key = match args.get(&self.def.key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(WeftError::tool(
                    &self.def.name,
                    format!("missing argument '{}'", self.def.key),
                ))
            }
        };

        self.def.answers.get(&key).cloned().ok_or_else(|| {
            WeftError::tool(
                &self.def.name,
                format!("no answer for {}={key}", self.def.key),
            )
        })
    }
}
