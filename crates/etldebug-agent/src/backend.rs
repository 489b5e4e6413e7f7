//! Model backends.
//!
//! A backend turns one [`ChatRequest`] into one [`ChatReply`]. It knows the
//! wire format of its server and nothing about tools beyond passing the
//! catalogue through; deciding between native and text tool calling is the
//! gateway's job.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use etldebug_tools::{ToolCatalogue, ToolInvocationRequest};

use crate::config::{self, ConfigError};
use crate::conversation::{Message, Role};

// =============================================================================
// Requests, replies, errors
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Function definitions for native tool calling; `None` in text mode.
    pub tools: Option<Vec<Value>>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocationRequest>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to reach {backend} at {url} (is it running?): {message}")]
    Unavailable {
        backend: String,
        url: String,
        message: String,
    },
    #[error("{backend} http error {status}: {body}")]
    Http {
        backend: String,
        status: u16,
        body: String,
    },
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("failed to load script {path}: {message}")]
    Script { path: PathBuf, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A chat-completion server.
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    fn chat(&self, request: &ChatRequest) -> Result<ChatReply, GatewayError>;

    /// Whether the model accepts native tool definitions. A transport failure
    /// is an error; a rejection is an answer.
    fn supports_native_tools(&self, catalogue: &ToolCatalogue) -> Result<bool, GatewayError>;

    /// Cheap reachability check.
    fn ping(&self) -> Result<(), GatewayError>;
}

fn http_client(timeout: Option<Duration>) -> Result<reqwest::blocking::Client, GatewayError> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Client(e.to_string()))
}

/// Arguments arrive as an object or as a JSON-encoded string depending on the
/// server. A string that does not decode is kept so validation can report it.
fn decode_arguments(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => json!({}),
        Some(Value::String(s)) if s.trim().is_empty() => json!({}),
        Some(Value::String(s)) => {
            serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
    }
}

// =============================================================================
// Ollama
// =============================================================================

pub struct OllamaBackend {
    host: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OllamaBackend {
    pub fn new(host: &str, model: &str, timeout: Option<Duration>) -> Result<Self, GatewayError> {
        Ok(Self {
            host: config::normalize_ollama_host(host),
            model: model.to_string(),
            client: http_client(timeout)?,
        })
    }

    fn wire_message(m: &Message) -> Value {
        let mut v = json!({ "role": m.role.as_str(), "content": m.content });
        if !m.tool_calls.is_empty() {
            v["tool_calls"] = Value::Array(
                m.tool_calls
                    .iter()
                    .map(|c| json!({ "function": { "name": c.tool, "arguments": c.args } }))
                    .collect(),
            );
        }
        if let Some(name) = &m.tool_name {
            v["tool_name"] = json!(name);
        }
        v
    }

    fn post_chat(&self, body: &Value) -> Result<(u16, String), GatewayError> {
        let url = format!("{}/api/chat", self.host);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| GatewayError::Unavailable {
                backend: "ollama".to_string(),
                url: url.clone(),
                message: format!("{e}. Try: `ollama serve` or set OLLAMA_HOST"),
            })?;
        let status = resp.status().as_u16();
        let text = resp.text().unwrap_or_default();
        Ok((status, text))
    }

    fn parse_reply(text: &str) -> ChatReply {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            // Returned as-is; the parser decides what to make of it.
            return ChatReply::text(text);
        };
        let message = &v["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        let f = &c["function"];
                        let name = f["name"].as_str()?;
                        Some(ToolInvocationRequest::new(
                            name,
                            decode_arguments(f.get("arguments")),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ChatReply {
            content,
            tool_calls,
        }
    }
}

impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn chat(&self, request: &ChatRequest) -> Result<ChatReply, GatewayError> {
        let messages: Vec<Value> = request.messages.iter().map(Self::wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "stream": false,
            "messages": messages,
            "options": { "temperature": 0 }
        });
        if let Some(tools) = &request.tools {
            body["tools"] = Value::Array(tools.clone());
        }
        if let Some(n) = request.max_tokens {
            body["options"]["num_predict"] = json!(n);
        }

        let (status, text) = self.post_chat(&body)?;
        if !(200..300).contains(&status) {
            return Err(GatewayError::Http {
                backend: "ollama".to_string(),
                status,
                body: text,
            });
        }
        Ok(Self::parse_reply(&text))
    }

    fn supports_native_tools(&self, catalogue: &ToolCatalogue) -> Result<bool, GatewayError> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [{ "role": "user", "content": "test" }],
            "tools": catalogue.function_json(),
            "options": { "temperature": 0, "num_predict": 1 }
        });
        let (status, text) = self.post_chat(&body)?;
        if (200..300).contains(&status) {
            return Ok(true);
        }
        let unsupported = text.to_ascii_lowercase().contains("does not support tools");
        debug!(status, unsupported, "ollama tool probe rejected");
        Ok(!unsupported)
    }

    fn ping(&self) -> Result<(), GatewayError> {
        let url = format!("{}/api/tags", self.host);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| GatewayError::Unavailable {
                backend: "ollama".to_string(),
                url: url.clone(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(GatewayError::Http {
                backend: "ollama".to_string(),
                status,
                body: resp.text().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// OpenAI-compatible chat completions
// =============================================================================

pub struct OpenAiBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl OpenAiBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            client: http_client(timeout)?,
        })
    }

    fn wire_message(m: &Message) -> Value {
        match m.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            }),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        json!({
                            "id": c.call_id.clone().unwrap_or_else(|| format!("call_{i}")),
                            "type": "function",
                            "function": { "name": c.tool, "arguments": c.args.to_string() }
                        })
                    })
                    .collect();
                json!({ "role": "assistant", "content": m.content, "tool_calls": calls })
            }
            role => json!({ "role": role.as_str(), "content": m.content }),
        }
    }

    fn parse_reply(text: &str) -> ChatReply {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return ChatReply::text(text);
        };
        let message = &v["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        let f = &c["function"];
                        let name = f["name"].as_str()?;
                        let mut req =
                            ToolInvocationRequest::new(name, decode_arguments(f.get("arguments")));
                        req.call_id = c["id"].as_str().map(str::to_string);
                        Some(req)
                    })
                    .collect()
            })
            .unwrap_or_default();
        ChatReply {
            content,
            tool_calls,
        }
    }

    fn unavailable(&self, url: &str, e: reqwest::Error) -> GatewayError {
        GatewayError::Unavailable {
            backend: "openai".to_string(),
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn chat(&self, request: &ChatRequest) -> Result<ChatReply, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let messages: Vec<Value> = request.messages.iter().map(Self::wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0
        });
        if let Some(tools) = &request.tools {
            body["tools"] = Value::Array(tools.clone());
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().map_err(|e| self.unavailable(&url, e))?;
        let status = resp.status().as_u16();
        let text = resp.text().unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(GatewayError::Http {
                backend: "openai".to_string(),
                status,
                body: text,
            });
        }
        Ok(Self::parse_reply(&text))
    }

    fn supports_native_tools(&self, _catalogue: &ToolCatalogue) -> Result<bool, GatewayError> {
        // Chat-completions servers accept `tools`; models that ignore them
        // still answer in text, which the parser handles.
        Ok(true)
    }

    fn ping(&self) -> Result<(), GatewayError> {
        let url = format!("{}/v1/models", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().map_err(|e| self.unavailable(&url, e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(GatewayError::Http {
                backend: "openai".to_string(),
                status,
                body: resp.text().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Scripted replies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptEntry {
    Text(String),
    Reply(ChatReply),
}

/// Replays canned replies.
///
/// The reply for a request is picked by the number of assistant messages it
/// already contains, so the backend holds no cursor and one instance can
/// serve concurrent sessions. Past the end of the script the last reply is
/// repeated; an empty script answers with empty text.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    model: String,
    replies: Vec<ChatReply>,
    native_tools: bool,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ChatReply>) -> Self {
        Self {
            model: "scripted".to_string(),
            replies,
            native_tools: false,
        }
    }

    pub fn from_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(ChatReply::text).collect())
    }

    /// Loads a YAML or JSON list whose entries are strings or
    /// `{content, tool_calls: [{tool, args}]}` objects.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let script_err = |message: String| GatewayError::Script {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| script_err(e.to_string()))?;
        let entries: Vec<ScriptEntry> =
            serde_yaml::from_str(&text).map_err(|e| script_err(e.to_string()))?;
        let replies = entries
            .into_iter()
            .map(|e| match e {
                ScriptEntry::Text(t) => ChatReply::text(t),
                ScriptEntry::Reply(r) => r,
            })
            .collect();
        Ok(Self::new(replies))
    }

    /// Report native tool support from the capability probe.
    pub fn with_native_tools(mut self, native: bool) -> Self {
        self.native_tools = native;
        self
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn chat(&self, request: &ChatRequest) -> Result<ChatReply, GatewayError> {
        let turn = request
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        Ok(self
            .replies
            .get(turn)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default())
    }

    fn supports_native_tools(&self, _catalogue: &ToolCatalogue) -> Result<bool, GatewayError> {
        Ok(self.native_tools)
    }

    fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    OpenAi,
    Scripted,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
            BackendKind::Scripted => "scripted",
        }
    }

    /// Flag, then `ETLDEBUG_BACKEND`, then ollama.
    pub fn resolve(flag: Option<&str>) -> Result<Self, ConfigError> {
        let raw = match flag.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => match config::env_value(config::ETLDEBUG_BACKEND_ENV)? {
                Some(s) => s,
                None => return Ok(BackendKind::Ollama),
            },
        };
        raw.parse().map_err(|_| ConfigError::Invalid {
            name: config::ETLDEBUG_BACKEND_ENV.to_string(),
            value: raw,
            expected: "ollama|openai|scripted".to_string(),
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "openai" => Ok(BackendKind::OpenAi),
            "scripted" => Ok(BackendKind::Scripted),
            other => Err(format!("unknown backend `{other}` (expected ollama|openai|scripted)")),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw overrides from the command line; unset fields fall back to the
/// environment and then to defaults when the backend is built.
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub kind: Option<String>,
    pub model: Option<String>,
    pub ollama_host: Option<String>,
    pub openai_base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub script: Option<PathBuf>,
}

impl BackendSettings {
    pub fn build(&self) -> Result<Box<dyn ChatBackend>, GatewayError> {
        let kind = BackendKind::resolve(self.kind.as_deref())?;
        let model = config::resolve_model(self.model.as_deref())?;
        let timeout = config::llm_timeout(self.timeout_secs)?;
        debug!(backend = %kind, %model, ?timeout, "building backend");

        Ok(match kind {
            BackendKind::Ollama => {
                let host = config::resolve_ollama_host(self.ollama_host.as_deref())?;
                Box::new(OllamaBackend::new(&host, &model, timeout)?)
            }
            BackendKind::OpenAi => {
                let base = config::resolve_openai_base_url(self.openai_base_url.as_deref())?;
                let key = config::openai_api_key()?;
                Box::new(OpenAiBackend::new(&base, &model, key, timeout)?)
            }
            BackendKind::Scripted => {
                let Some(path) = &self.script else {
                    return Err(ConfigError::Missing(
                        "the scripted backend needs --script <file>".to_string(),
                    )
                    .into());
                };
                Box::new(ScriptedBackend::from_file(path)?)
            }
        })
    }
}
