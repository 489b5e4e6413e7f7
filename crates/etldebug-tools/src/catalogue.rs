//! Tool catalogue and the request/observation records that flow through the loop.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
}

impl ParamKind {
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// One catalogue entry: unique name, description and parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// JSON-schema object for the parameters.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({ "type": p.kind.json_type(), "description": p.description }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// `{"type": "function", "function": {...}}`, the shape both Ollama and
    /// OpenAI-compatible chat endpoints accept in `tools`.
    pub fn function_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.json_schema(),
            }
        })
    }

    /// One-line signature for text prompts: `sample_values(table_name: string, limit?: integer)`.
    pub fn signature(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "{}{}: {}",
                    p.name,
                    if p.required { "" } else { "?" },
                    p.kind.json_type()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({params})", self.name)
    }
}

/// Immutable, cheaply cloneable list of tool specs.
#[derive(Debug, Clone)]
pub struct ToolCatalogue {
    specs: Arc<[ToolSpec]>,
}

impl ToolCatalogue {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self {
            specs: specs.into(),
        }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn function_json(&self) -> Vec<Value> {
        self.specs.iter().map(ToolSpec::function_json).collect()
    }

    /// Human-readable listing used in text prompts and `list-tools`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for spec in self.specs.iter() {
            out.push_str(&format!("- {}: {}\n", spec.signature(), spec.description));
            for p in &spec.parameters {
                out.push_str(&format!(
                    "    {} ({}{}): {}\n",
                    p.name,
                    p.kind.json_type(),
                    if p.required { ", required" } else { "" },
                    p.description
                ));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    /// Backend-assigned call id, echoed back on the observation message when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl ToolInvocationRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolObservation {
    pub tool: String,
    pub success: bool,
    /// Result text on success, error description otherwise.
    pub payload: String,
}

impl ToolObservation {
    pub fn ok(tool: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: true,
            payload: payload.into(),
        }
    }

    pub fn error(tool: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            payload: payload.into(),
        }
    }
}
