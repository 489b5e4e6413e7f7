//! Dual-mode model gateway.
//!
//! The loop always hands over the same [`Conversation`]; the selected
//! [`ToolProtocol`] decides how tools reach the model. Native mode passes
//! the catalogue as function definitions. Structured mode writes it into the
//! system prompt and teaches the `TOOL_CALL:` convention, for models that
//! reject native tools.

use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info};

use etldebug_tools::{ToolCatalogue, ToolInvocationRequest};

use crate::backend::{ChatBackend, ChatRequest, GatewayError};
use crate::conversation::{Conversation, Message, Role};
use crate::prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolModeSetting {
    #[default]
    Auto,
    Native,
    Structured,
}

impl ToolModeSetting {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolModeSetting::Auto => "auto",
            ToolModeSetting::Native => "native",
            ToolModeSetting::Structured => "structured",
        }
    }
}

impl FromStr for ToolModeSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ToolModeSetting::Auto),
            "native" => Ok(ToolModeSetting::Native),
            "structured" => Ok(ToolModeSetting::Structured),
            other => Err(format!(
                "unknown tool mode `{other}` (expected auto|native|structured)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    Native,
    Structured,
}

impl ToolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolMode::Native => "native",
            ToolMode::Structured => "structured",
        }
    }
}

impl std::fmt::Display for ToolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conversation and catalogue become a backend request.
pub trait ToolProtocol: Send + Sync {
    fn mode(&self) -> ToolMode;

    fn build_request(&self, conversation: &Conversation, catalogue: &ToolCatalogue) -> ChatRequest;
}

pub struct NativeProtocol;

impl ToolProtocol for NativeProtocol {
    fn mode(&self) -> ToolMode {
        ToolMode::Native
    }

    fn build_request(&self, conversation: &Conversation, catalogue: &ToolCatalogue) -> ChatRequest {
        ChatRequest {
            messages: conversation.messages().to_vec(),
            tools: Some(catalogue.function_json()),
            max_tokens: None,
        }
    }
}

pub struct StructuredTextProtocol;

impl StructuredTextProtocol {
    fn render_call(call: &ToolInvocationRequest) -> String {
        let v = serde_json::json!({ "tool": call.tool, "args": call.args });
        format!("TOOL_CALL: {v}")
    }
}

impl ToolProtocol for StructuredTextProtocol {
    fn mode(&self) -> ToolMode {
        ToolMode::Structured
    }

    fn build_request(&self, conversation: &Conversation, catalogue: &ToolCatalogue) -> ChatRequest {
        let tool_section = prompt::structured_tool_instructions(catalogue);
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        let mut saw_system = false;

        for m in conversation.messages() {
            match m.role {
                Role::System if !saw_system => {
                    saw_system = true;
                    messages.push(Message::new(
                        Role::System,
                        format!("{}\n\n{tool_section}", m.content.trim_end()),
                    ));
                }
                Role::Tool => {
                    let name = m.tool_name.as_deref().unwrap_or("tool");
                    messages.push(Message::new(
                        Role::User,
                        format!("Tool '{name}' returned:\n{}", m.content),
                    ));
                }
                Role::Assistant if !m.tool_calls.is_empty() => {
                    // Whatever followed the first call marker is replaced by
                    // the calls that were actually dispatched.
                    let head = match m.content.to_ascii_uppercase().find("TOOL_CALL") {
                        Some(idx) => &m.content[..idx],
                        None => m.content.as_str(),
                    };
                    let mut text = head.trim().to_string();
                    for call in &m.tool_calls {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&Self::render_call(call));
                    }
                    messages.push(Message::new(Role::Assistant, text));
                }
                _ => messages.push(Message::new(m.role, m.content.clone())),
            }
        }
        if !saw_system {
            messages.insert(0, Message::new(Role::System, tool_section));
        }

        ChatRequest {
            messages,
            tools: None,
            max_tokens: None,
        }
    }
}

/// One normalized assistant response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub mode: ToolMode,
    pub text: String,
    pub native_calls: Vec<ToolInvocationRequest>,
}

/// A backend bound to one protocol for the length of a session.
pub struct ModelGateway<'a> {
    backend: &'a dyn ChatBackend,
    catalogue: &'a ToolCatalogue,
    protocol: Box<dyn ToolProtocol>,
}

impl<'a> ModelGateway<'a> {
    /// Resolves the tool mode. `Auto` asks the backend once; an unreachable
    /// backend is an error here rather than on the first turn.
    pub fn connect(
        backend: &'a dyn ChatBackend,
        catalogue: &'a ToolCatalogue,
        setting: ToolModeSetting,
    ) -> Result<Self, GatewayError> {
        let mode = match setting {
            ToolModeSetting::Native => ToolMode::Native,
            ToolModeSetting::Structured => ToolMode::Structured,
            ToolModeSetting::Auto => {
                if backend.supports_native_tools(catalogue)? {
                    ToolMode::Native
                } else {
                    ToolMode::Structured
                }
            }
        };
        info!(backend = backend.name(), model = backend.model(), %mode, "tool mode resolved");
        Ok(Self::with_mode(backend, catalogue, mode))
    }

    pub fn with_mode(backend: &'a dyn ChatBackend, catalogue: &'a ToolCatalogue, mode: ToolMode) -> Self {
        let protocol: Box<dyn ToolProtocol> = match mode {
            ToolMode::Native => Box::new(NativeProtocol),
            ToolMode::Structured => Box::new(StructuredTextProtocol),
        };
        Self {
            backend,
            catalogue,
            protocol,
        }
    }

    pub fn mode(&self) -> ToolMode {
        self.protocol.mode()
    }

    pub fn complete(&self, conversation: &Conversation) -> Result<ModelResponse, GatewayError> {
        let request = self.protocol.build_request(conversation, self.catalogue);
        debug!(messages = request.messages.len(), mode = %self.mode(), "model request");
        let reply = self.backend.chat(&request)?;
        let native_calls = match self.mode() {
            ToolMode::Native => reply.tool_calls,
            // Not advertised in text mode; anything the server volunteers is ignored.
            ToolMode::Structured => Vec::new(),
        };
        Ok(ModelResponse {
            mode: self.mode(),
            text: reply.content,
            native_calls,
        })
    }
}
