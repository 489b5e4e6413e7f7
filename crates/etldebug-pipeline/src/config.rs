use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::{PipelineError, Result};

/// SQL engine a pipeline writes into.
///
/// Any other engine name fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Sqlite,
    DuckDb,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::DuckDb => "duckdb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub engine: Engine,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub transform: TransformConfig,
}

impl PipelineConfig {
    /// Source tables the pipeline declares.
    ///
    /// `source.tables` wins; otherwise a file-backed source contributes the stem
    /// of its path (`data/source_data.csv` loads as `source_data`).
    pub fn declared_source_tables(&self) -> Vec<String> {
        if let Some(tables) = &self.source.tables {
            return tables.clone();
        }
        self.source
            .path
            .as_deref()
            .and_then(|p| Path::new(p).file_stem())
            .map(|stem| vec![stem.to_string_lossy().to_string()])
            .unwrap_or_default()
    }
}

pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| PipelineError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `error.log` next to the pipeline definition.
///
/// A missing log is not an error: callers decide whether an empty log is usable.
pub fn load_error_log(pipeline_path: impl AsRef<Path>) -> Result<String> {
    let Some(dir) = pipeline_path.as_ref().parent() else {
        return Ok(String::new());
    };
    let log_path = dir.join("error.log");
    if !log_path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(&log_path).map_err(|source| PipelineError::Io {
        path: log_path,
        source,
    })
}
