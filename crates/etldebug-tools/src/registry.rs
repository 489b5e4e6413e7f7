use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use etldebug_pipeline::{DbConnection, Engine, SandboxDb};

use crate::catalogue::{ToolCatalogue, ToolInvocationRequest, ToolObservation, ToolSpec};
use crate::ToolError;

/// Data handle a tool executes against: one session's sandbox database, the
/// directory `read_file` is confined to, and the session's error log.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub db_path: PathBuf,
    pub engine: Engine,
    pub base_dir: PathBuf,
    pub error_log: String,
}

impl ToolContext {
    pub fn new(db: &SandboxDb, base_dir: &Path, error_log: impl Into<String>) -> Self {
        let base_dir = base_dir
            .canonicalize()
            .unwrap_or_else(|_| base_dir.to_path_buf());
        Self {
            db_path: db.path().to_path_buf(),
            engine: db.engine(),
            base_dir,
            error_log: error_log.into(),
        }
    }

    pub fn connect(&self) -> Result<DbConnection, ToolError> {
        Ok(DbConnection::open(self.engine, &self.db_path)?)
    }

    /// Reject an explicit `engine` argument that names a different engine.
    pub fn check_engine(&self, requested: Option<&str>) -> Result<(), ToolError> {
        match requested {
            Some(e) if !e.trim().is_empty() && !e.trim().eq_ignore_ascii_case(self.engine.as_str()) => {
                Err(ToolError::EngineMismatch {
                    requested: e.trim().to_string(),
                    session: self.engine.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Arguments that already passed schema validation.
#[derive(Debug, Clone)]
pub struct ToolArgs<'a> {
    tool: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> ToolArgs<'a> {
    pub fn str(&self, name: &str) -> Option<&'a str> {
        self.map.get(name).and_then(Value::as_str)
    }

    pub fn required_str(&self, name: &str) -> Result<&'a str, ToolError> {
        self.str(name).ok_or_else(|| ToolError::InvalidArguments {
            tool: self.tool.to_string(),
            message: format!("missing required argument `{name}`"),
        })
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.map.get(name).and_then(Value::as_i64)
    }
}

/// A capability the loop can invoke by name.
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    catalogue: ToolCatalogue,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.catalogue.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Result<Self, ToolError> {
        let mut specs: Vec<ToolSpec> = Vec::with_capacity(tools.len());
        for tool in &tools {
            let spec = tool.spec();
            if specs.iter().any(|s| s.name == spec.name) {
                return Err(ToolError::DuplicateTool(spec.name.clone()));
            }
            specs.push(spec.clone());
        }
        Ok(Self {
            tools,
            catalogue: ToolCatalogue::new(specs),
        })
    }

    /// The six standard tools.
    pub fn standard() -> Self {
        let tools: Vec<Box<dyn Tool>> = vec![
            Box::new(crate::sql::ExecuteSql::new()),
            Box::new(crate::sql::InspectSchema::new()),
            Box::new(crate::sql::CompareSchemas::new()),
            Box::new(crate::sql::SampleValues::new()),
            Box::new(crate::logs::ParseLogs::new()),
            Box::new(crate::files::ReadFile::new()),
        ];
        let specs = tools.iter().map(|t| t.spec().clone()).collect();
        Self {
            tools,
            catalogue: ToolCatalogue::new(specs),
        }
    }

    pub fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    /// Validate and execute one request. Never fails: unknown tools, bad
    /// arguments and execution errors all come back as `success: false`.
    pub fn dispatch(&self, request: &ToolInvocationRequest, ctx: &ToolContext) -> ToolObservation {
        let result = self.try_dispatch(request, ctx);
        match result {
            Ok(payload) => {
                tracing::debug!(tool = %request.tool, bytes = payload.len(), "tool succeeded");
                ToolObservation::ok(&request.tool, payload)
            }
            Err(err) => {
                tracing::debug!(tool = %request.tool, error = %err, "tool failed");
                ToolObservation::error(&request.tool, format!("Error: {err}"))
            }
        }
    }

    fn try_dispatch(
        &self,
        request: &ToolInvocationRequest,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let Some(tool) = self.tools.iter().find(|t| t.spec().name == request.tool) else {
            return Err(ToolError::UnknownTool {
                name: request.tool.clone(),
                available: self.catalogue.names().iter().map(|s| s.to_string()).collect(),
            });
        };
        let empty = Map::new();
        let map = validate_args(tool.spec(), &request.args, &empty)?;
        let args = ToolArgs {
            tool: &tool.spec().name,
            map,
        };
        tool.execute(&args, ctx)
    }
}

fn validate_args<'a>(
    spec: &ToolSpec,
    args: &'a Value,
    empty: &'a Map<String, Value>,
) -> Result<&'a Map<String, Value>, ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: spec.name.clone(),
        message,
    };

    let map = match args {
        Value::Object(map) => map,
        Value::Null => empty,
        other => {
            return Err(invalid(format!(
                "arguments must be a JSON object, got {}",
                json_kind(other)
            )))
        }
    };

    let mut problems: Vec<String> = Vec::new();
    for p in &spec.parameters {
        match map.get(&p.name) {
            None | Some(Value::Null) if p.required => {
                problems.push(format!("missing required argument `{}`", p.name))
            }
            Some(v) if !v.is_null() && !p.kind.accepts(v) => problems.push(format!(
                "argument `{}` must be {}, got {}",
                p.name,
                p.kind.json_type(),
                json_kind(v)
            )),
            _ => {}
        }
    }
    let mut extra: Vec<&str> = map
        .keys()
        .filter(|k| spec.param(k).is_none())
        .map(String::as_str)
        .collect();
    extra.sort_unstable();
    if !extra.is_empty() {
        let allowed: Vec<&str> = spec.parameters.iter().map(|p| p.name.as_str()).collect();
        problems.push(format!(
            "unexpected argument(s) {}; allowed: {}",
            extra.join(", "),
            allowed.join(", ")
        ));
    }

    if problems.is_empty() {
        Ok(map)
    } else {
        Err(invalid(problems.join("; ")))
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
