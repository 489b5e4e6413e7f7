//! Disposable databases.
//!
//! A [`SandboxDb`] owns a private temporary directory; dropping it removes the
//! database file. Sessions and the scorer each work on their own copy, so no
//! two cases (or a session and its scoring) ever touch the same file.
//!
//! DuckDB files take a lock while open, so callers hold at most one
//! connection to a sandbox at a time.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::{Engine, PipelineConfig};
use crate::db::DbConnection;
use crate::{PipelineError, Result};

fn db_file(engine: Engine) -> &'static str {
    match engine {
        Engine::Sqlite => "sandbox.db",
        Engine::DuckDb => "sandbox.duckdb",
    }
}

#[derive(Debug)]
pub struct SandboxDb {
    _dir: TempDir,
    path: PathBuf,
    engine: Engine,
}

impl SandboxDb {
    /// Build a fresh database for `pipeline` from the files in `case_dir`.
    ///
    /// Every `*.csv` file becomes a table named after its stem with all
    /// columns as TEXT (values kept verbatim, including empty strings).
    /// `schema.sql`, or `dest_schema.sql` when absent, then creates the
    /// destination objects.
    pub fn provision(pipeline: &PipelineConfig, case_dir: &Path) -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|source| PipelineError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let engine = pipeline.destination.engine;
        let path = dir.path().join(db_file(engine));
        let mut conn = DbConnection::open(engine, &path)?;

        let mut csv_files: Vec<PathBuf> = fs::read_dir(case_dir)
            .map_err(|source| PipelineError::Io {
                path: case_dir.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
            .collect();
        csv_files.sort();

        for csv_path in &csv_files {
            load_csv_table(&mut conn, csv_path)?;
        }

        for schema_name in ["schema.sql", "dest_schema.sql"] {
            let schema_path = case_dir.join(schema_name);
            if schema_path.exists() {
                let ddl = fs::read_to_string(&schema_path).map_err(|source| PipelineError::Io {
                    path: schema_path.clone(),
                    source,
                })?;
                conn.execute_batch(&ddl)?;
                break;
            }
        }
        drop(conn);

        tracing::debug!(
            pipeline = %pipeline.name,
            engine = %engine,
            tables = csv_files.len(),
            db = %path.display(),
            "provisioned sandbox database"
        );

        Ok(Self {
            _dir: dir,
            path,
            engine,
        })
    }

    /// Copy this database into a new, independent sandbox.
    pub fn fork(&self) -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|source| PipelineError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let path = dir.path().join(db_file(self.engine));
        fs::copy(&self.path, &path).map_err(|source| PipelineError::Io {
            path: self.path.clone(),
            source,
        })?;
        let wal = wal_path(&self.path);
        if wal.exists() {
            fs::copy(&wal, wal_path(&path)).map_err(|source| PipelineError::Io { path: wal, source })?;
        }
        Ok(Self {
            _dir: dir,
            path,
            engine: self.engine,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn connect(&self) -> Result<DbConnection> {
        Ok(DbConnection::open(self.engine, &self.path)?)
    }
}

fn wal_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

/// Quote an identifier (`"a""b"`); SQLite and DuckDB agree on the form.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn load_csv_table(conn: &mut DbConnection, csv_path: &Path) -> Result<()> {
    let Some(table) = csv_path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
        return Ok(());
    };
    let csv_err = |source| PipelineError::Csv {
        path: csv_path.to_path_buf(),
        source,
    };

    let mut reader = csv::Reader::from_path(csv_path).map_err(csv_err)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Ok(());
    }

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    conn.load_text_table(&table, &headers, &records)?;
    Ok(())
}
