//! The diagnosis loop and everything it talks to.
//!
//! ```text
//! precompute ──► agent loop ──► gateway ──► backend (ollama / openai / scripted)
//!                   │   ▲
//!                   ▼   │
//!                 parser ─► tool registry (etldebug-tools)
//! ```
//!
//! The model is untrusted. Its replies go through [`parser::ResponseParser`]
//! and, failing that, [`fallback::salvage`]; a session always ends with a
//! [`Diagnosis`], and only a backend failure is surfaced as an error.

pub mod agent;
pub mod backend;
pub mod config;
pub mod conversation;
pub mod diagnosis;
pub mod fallback;
pub mod gateway;
pub mod json;
pub mod parser;
pub mod precompute;
pub mod prompt;

pub use agent::{AgentConfig, DiagnosisAgent, SessionInput, SessionOutcome, StepKind, StepRecord};
pub use backend::{
    BackendKind, BackendSettings, ChatBackend, ChatReply, ChatRequest, GatewayError,
    OllamaBackend, OpenAiBackend, ScriptedBackend,
};
pub use config::ConfigError;
pub use conversation::{Conversation, Message, Role};
pub use diagnosis::{Confidence, Diagnosis, DiagnosisStatus};
pub use gateway::{ModelGateway, ModelResponse, ToolMode, ToolModeSetting};
pub use parser::{FinalAnswer, ParsedResponse, ResponseParser};
pub use precompute::{precompute, DiagnosticsReport};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Backend(#[from] GatewayError),
}
