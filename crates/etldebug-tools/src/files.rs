use std::fs;
use std::path::{Path, PathBuf};

use crate::catalogue::{ParamKind, ParamSpec, ToolSpec};
use crate::registry::{Tool, ToolArgs, ToolContext};
use crate::ToolError;

const MAX_FILE_CHARS: usize = 2000;

/// Read a file confined to `base_dir`. Relative paths resolve against
/// `base_dir`; symlinks and `..` are resolved before the containment check.
pub fn read_sandboxed(base_dir: &Path, file_path: &str) -> Result<String, ToolError> {
    let requested = PathBuf::from(file_path.trim());
    let joined = if requested.is_absolute() {
        requested
    } else {
        base_dir.join(requested)
    };
    let resolved = joined
        .canonicalize()
        .map_err(|_| ToolError::NotFound(format!("File not found: {file_path}")))?;
    if !resolved.starts_with(base_dir) {
        return Err(ToolError::AccessDenied {
            path: resolved,
            base: base_dir.to_path_buf(),
        });
    }
    if !resolved.is_file() {
        return Err(ToolError::NotFound(format!("Not a file: {file_path}")));
    }

    let bytes = fs::read(&resolved).map_err(|source| ToolError::Io {
        path: resolved.clone(),
        source,
    })?;
    let content = String::from_utf8_lossy(&bytes);
    let total = content.chars().count();
    if total > MAX_FILE_CHARS {
        let head: String = content.chars().take(MAX_FILE_CHARS).collect();
        return Ok(format!("{head}\n... (truncated, {total} total characters)"));
    }
    Ok(content.into_owned())
}

pub struct ReadFile {
    spec: ToolSpec,
}

impl ReadFile {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "read_file".to_string(),
                description: "Read a file from the pipeline's directory (pipeline config, CSV data, SQL scripts). Long files are truncated.".to_string(),
                parameters: vec![ParamSpec::required(
                    "file_path",
                    ParamKind::String,
                    "Path relative to the pipeline directory",
                )],
            },
        }
    }
}

impl Tool for ReadFile {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        read_sandboxed(&ctx.base_dir, args.required_str("file_path")?)
    }
}
