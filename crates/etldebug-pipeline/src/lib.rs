//! Pipeline definitions and the filesystem-resident pieces around them.
//!
//! - `config`: the YAML pipeline definition (`pipeline.yaml`) and its error log
//! - `golden`: the golden-set layout (`manifest.yaml` + one directory per case)
//! - `sql_analysis`: structural facts about a transform statement (join keys, tables)
//! - `db`: one connection type over SQLite and DuckDB
//! - `sandbox`: disposable database copies a session or a scorer can mutate freely

pub mod config;
pub mod db;
pub mod golden;
pub mod sandbox;
pub mod sql_analysis;

pub use config::{
    load_error_log, load_pipeline, DestinationConfig, Engine, PipelineConfig, SourceConfig,
    TransformConfig,
};
pub use db::{DbConnection, DbError, ResultSet, SqlValue, StatementOutcome};
pub use golden::{CaseManifestEntry, EvalCase, ExpectedFix, ExpectedResult, GoldenSet};
pub use sandbox::{quote_ident, SandboxDb};
pub use sql_analysis::{
    analyze_transform, ColumnMapping, ColumnRef, JoinKey, TableRef, TransformShape,
};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to load CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("invalid case `{case}`: {message}")]
    InvalidCase { case: String, message: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
