//! Tools the diagnosis loop can call, and the dispatcher that runs them.
//!
//! Every tool declares a [`ToolSpec`]; the [`ToolRegistry`] validates a
//! [`ToolInvocationRequest`] against it before execution and turns every
//! failure into a [`ToolObservation`] with `success: false`. Nothing a model
//! asks for can abort the loop from here.

pub mod catalogue;
pub mod files;
pub mod fix;
pub mod logs;
pub mod registry;
pub mod sql;

pub use catalogue::{
    ParamKind, ParamSpec, ToolCatalogue, ToolInvocationRequest, ToolObservation, ToolSpec,
};
pub use fix::{apply_fix, FixOutcome};
pub use registry::{Tool, ToolArgs, ToolContext, ToolRegistry};
pub use sql::{ResultSet, SqlValue};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool `{name}`; available tools: {}", available.join(", "))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("duplicate tool name `{0}`")]
    DuplicateTool(String),
    #[error("engine `{requested}` is not available; this session uses `{session}`")]
    EngineMismatch { requested: String, session: String },
    #[error("SQL error: {0}")]
    Sql(#[from] etldebug_pipeline::DbError),
    #[error("{0}")]
    NotFound(String),
    #[error("access denied: {path} is outside {base}")]
    AccessDenied { path: PathBuf, base: PathBuf },
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
