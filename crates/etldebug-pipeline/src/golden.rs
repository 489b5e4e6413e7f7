//! Golden-set layout.
//!
//! ```text
//! golden_set/
//!   manifest.yaml
//!   case_01_schema_mismatch/
//!     pipeline.yaml  error.log  *.csv  schema.sql  expected_fix.yaml
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{load_error_log, load_pipeline, Engine, PipelineConfig};
use crate::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseManifestEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub category: String,
    pub engine: Engine,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    cases: Vec<CaseManifestEntry>,
}

/// Expected verification result. `rows` are kept as JSON values so YAML
/// integers, reals, strings and nulls survive untouched until comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedFix {
    pub root_cause: String,
    #[serde(default = "default_fix_type")]
    pub fix_type: String,
    #[serde(default)]
    pub fix_description: String,
    #[serde(default)]
    pub fixed_sql: String,
    #[serde(default)]
    pub verification_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<ExpectedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_count_min: Option<u64>,
}

fn default_fix_type() -> String {
    "sql_modification".to_string()
}

#[derive(Debug, Clone)]
pub struct GoldenSet {
    pub root: PathBuf,
    pub cases: Vec<CaseManifestEntry>,
}

impl GoldenSet {
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest_path = root.join("manifest.yaml");
        let text = fs::read_to_string(&manifest_path).map_err(|source| PipelineError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_yaml::from_str(&text).map_err(|source| PipelineError::Yaml {
                path: manifest_path,
                source,
            })?;
        Ok(Self {
            root,
            cases: manifest.cases,
        })
    }

    /// Cases whose id starts with `prefix` (all cases when `None`), in manifest order.
    pub fn select(&self, prefix: Option<&str>) -> Vec<&CaseManifestEntry> {
        self.cases
            .iter()
            .filter(|c| prefix.map_or(true, |p| c.id.starts_with(p)))
            .collect()
    }

    pub fn case_dir(&self, entry: &CaseManifestEntry) -> PathBuf {
        self.root.join(&entry.id)
    }
}

/// One fully loaded golden-set case.
#[derive(Debug, Clone)]
pub struct EvalCase {
    pub id: String,
    pub name: String,
    pub difficulty: String,
    pub category: String,
    pub dir: PathBuf,
    pub pipeline_path: PathBuf,
    pub pipeline: PipelineConfig,
    pub error_log: String,
    pub expected: ExpectedFix,
}

impl EvalCase {
    pub fn load(golden: &GoldenSet, entry: &CaseManifestEntry) -> Result<Self> {
        let dir = golden.case_dir(entry);
        let pipeline_path = dir.join("pipeline.yaml");
        let pipeline = load_pipeline(&pipeline_path)?;
        if pipeline.destination.engine != entry.engine {
            return Err(PipelineError::InvalidCase {
                case: entry.id.clone(),
                message: format!(
                    "manifest engine `{}` does not match pipeline engine `{}`",
                    entry.engine, pipeline.destination.engine
                ),
            });
        }
        let error_log = load_error_log(&pipeline_path)?;

        let expected_path = dir.join("expected_fix.yaml");
        let text = fs::read_to_string(&expected_path).map_err(|source| PipelineError::Io {
            path: expected_path.clone(),
            source,
        })?;
        let expected: ExpectedFix =
            serde_yaml::from_str(&text).map_err(|source| PipelineError::Yaml {
                path: expected_path,
                source,
            })?;
        if expected.root_cause.trim().is_empty() {
            return Err(PipelineError::InvalidCase {
                case: entry.id.clone(),
                message: "expected_fix.yaml has an empty root_cause".to_string(),
            });
        }

        Ok(Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            difficulty: entry.difficulty.clone(),
            category: entry.category.clone(),
            dir,
            pipeline_path,
            pipeline,
            error_log,
            expected,
        })
    }
}
