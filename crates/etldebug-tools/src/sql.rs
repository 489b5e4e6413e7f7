//! SQL tools over the session's sandbox database.

use serde::Serialize;

use etldebug_pipeline::{quote_ident, DbConnection};

use crate::catalogue::{ParamKind, ParamSpec, ToolSpec};
use crate::registry::{Tool, ToolArgs, ToolContext};
use crate::ToolError;

pub use etldebug_pipeline::{ResultSet, SqlValue, StatementOutcome};

/// Rows shown by `execute_sql` before the result is cut off.
pub const MAX_DISPLAY_ROWS: usize = 50;
const DEFAULT_SAMPLE_LIMIT: i64 = 10;
const MAX_SAMPLE_LIMIT: i64 = 50;

/// Run every statement in `sql` in order, stopping at the first error.
pub fn run_statements(
    conn: &DbConnection,
    sql: &str,
    row_cap: Option<usize>,
) -> Result<Vec<StatementOutcome>, ToolError> {
    Ok(conn.run_statements(sql, row_cap)?)
}

/// Run `sql` and return the last result set it produced.
pub fn query_result_set(conn: &DbConnection, sql: &str) -> Result<ResultSet, ToolError> {
    run_statements(conn, sql, None)?
        .into_iter()
        .rev()
        .find_map(|o| match o {
            StatementOutcome::Rows { result, .. } => Some(result),
            StatementOutcome::Affected(_) => None,
        })
        .ok_or_else(|| ToolError::NotFound("query returned no result set".to_string()))
}

// ============================================================================
// Schema helpers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// SQLite column affinity for a declared type (section 3.1 of the SQLite docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    pub fn of(decl_type: &str) -> Self {
        let t = decl_type.to_ascii_uppercase();
        if t.contains("INT") {
            Affinity::Integer
        } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
            Affinity::Text
        } else if t.is_empty() || t.contains("BLOB") {
            Affinity::Blob
        } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Affinity::Integer | Affinity::Real | Affinity::Numeric)
    }
}

pub fn list_tables(conn: &DbConnection) -> Result<Vec<String>, ToolError> {
    Ok(conn.list_tables()?)
}

fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Columns of `table`; a missing table is a `NotFound` error that lists the
/// tables that do exist.
pub fn table_columns(conn: &DbConnection, table: &str) -> Result<Vec<ColumnInfo>, ToolError> {
    let available = list_tables(conn)?;
    let Some(name) = available.iter().find(|t| t.eq_ignore_ascii_case(table)) else {
        return Err(ToolError::NotFound(format!(
            "Table '{table}' not found. Available tables: {}",
            available.join(", ")
        )));
    };
    let info = conn.query(&format!(
        "SELECT \"name\", \"type\", \"notnull\", \"pk\" FROM pragma_table_info({}) ORDER BY cid",
        string_literal(name)
    ))?;
    let flag = |v: Option<&SqlValue>| v.and_then(SqlValue::as_i64).is_some_and(|n| n != 0);
    Ok(info
        .rows
        .iter()
        .map(|r| ColumnInfo {
            name: r.first().map(ToString::to_string).unwrap_or_default(),
            decl_type: match r.get(1) {
                Some(SqlValue::Null) | None => String::new(),
                Some(v) => v.to_string(),
            },
            not_null: flag(r.get(2)),
            primary_key: flag(r.get(3)),
        })
        .collect())
}

pub fn row_count(conn: &DbConnection, table: &str) -> Result<i64, ToolError> {
    Ok(conn.query_i64(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Match,
    TypeDiffers,
    OnlyInSource,
    OnlyInDest,
}

impl DiffStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DiffStatus::Match => "ok",
            DiffStatus::TypeDiffers => "TYPE MISMATCH",
            DiffStatus::OnlyInSource => "ONLY IN SOURCE",
            DiffStatus::OnlyInDest => "ONLY IN DEST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDiff {
    pub column: String,
    pub source_type: Option<String>,
    pub dest_type: Option<String>,
    pub status: DiffStatus,
}

/// Pair columns by case-insensitive name. Source order first, then
/// destination-only columns in destination order. Types are compared by
/// affinity, so `VARCHAR(20)` and `TEXT` match.
pub fn compare_columns(source: &[ColumnInfo], dest: &[ColumnInfo]) -> Vec<ColumnDiff> {
    let mut out = Vec::new();
    for s in source {
        let d = dest.iter().find(|d| d.name.eq_ignore_ascii_case(&s.name));
        let status = match d {
            None => DiffStatus::OnlyInSource,
            Some(d) if Affinity::of(&d.decl_type) != Affinity::of(&s.decl_type) => {
                DiffStatus::TypeDiffers
            }
            Some(_) => DiffStatus::Match,
        };
        out.push(ColumnDiff {
            column: s.name.clone(),
            source_type: Some(s.decl_type.clone()),
            dest_type: d.map(|d| d.decl_type.clone()),
            status,
        });
    }
    for d in dest {
        if !source.iter().any(|s| s.name.eq_ignore_ascii_case(&d.name)) {
            out.push(ColumnDiff {
                column: d.name.clone(),
                source_type: None,
                dest_type: Some(d.decl_type.clone()),
                status: DiffStatus::OnlyInDest,
            });
        }
    }
    out
}

pub fn render_column_diff(source_table: &str, dest_table: &str, diffs: &[ColumnDiff]) -> String {
    let mut lines = vec![
        format!("Comparing {source_table} (source) -> {dest_table} (destination)"),
        String::new(),
        format!("{:<24} {:<15} {:<15} {}", "Column", "Source type", "Dest type", "Status"),
        format!("{} {} {} {}", "-".repeat(24), "-".repeat(15), "-".repeat(15), "-".repeat(14)),
    ];
    for d in diffs {
        lines.push(format!(
            "{:<24} {:<15} {:<15} {}",
            d.column,
            d.source_type.as_deref().unwrap_or("-"),
            d.dest_type.as_deref().unwrap_or("-"),
            d.status.label()
        ));
    }
    let problems = diffs.iter().filter(|d| d.status != DiffStatus::Match).count();
    lines.push(String::new());
    lines.push(if problems == 0 {
        "No column differences.".to_string()
    } else {
        format!("{problems} column difference(s).")
    });
    lines.join("\n")
}

/// Distinct values of `column`, ordered, at most `limit`. NULL sorts first.
pub fn distinct_values(
    conn: &DbConnection,
    table: &str,
    column: &str,
    limit: usize,
) -> Result<Vec<SqlValue>, ToolError> {
    let sql = format!(
        "SELECT DISTINCT {col} FROM {table} ORDER BY {col} NULLS FIRST LIMIT {limit}",
        col = quote_ident(column),
        table = quote_ident(table),
    );
    Ok(conn
        .query(&sql)?
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next())
        .collect())
}

pub fn distinct_count(conn: &DbConnection, table: &str, column: &str) -> Result<i64, ToolError> {
    Ok(conn.query_i64(&format!(
        "SELECT COUNT(DISTINCT {}) FROM {}",
        quote_ident(column),
        quote_ident(table)
    ))?)
}

/// Number of distinct values present on both sides of a join.
pub fn join_overlap(
    conn: &DbConnection,
    left_table: &str,
    left_column: &str,
    right_table: &str,
    right_column: &str,
) -> Result<i64, ToolError> {
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT {lc} FROM {lt} INTERSECT SELECT {rc} FROM {rt})",
        lc = quote_ident(left_column),
        lt = quote_ident(left_table),
        rc = quote_ident(right_column),
        rt = quote_ident(right_table),
    );
    Ok(conn.query_i64(&sql)?)
}

/// Distinct non-null text values of `column` that do not read as numbers.
/// Scans at most `scan` distinct values and returns at most `limit`.
pub fn non_numeric_values(
    conn: &DbConnection,
    table: &str,
    column: &str,
    scan: usize,
    limit: usize,
) -> Result<Vec<String>, ToolError> {
    let values = distinct_values(conn, table, column, scan)?;
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            SqlValue::Text(t) if t.trim().parse::<f64>().is_err() => Some(t),
            _ => None,
        })
        .take(limit)
        .collect())
}

fn require_column(conn: &DbConnection, table: &str, column: &str) -> Result<String, ToolError> {
    let cols = table_columns(conn, table)?;
    cols.iter()
        .find(|c| c.name.eq_ignore_ascii_case(column))
        .map(|c| c.name.clone())
        .ok_or_else(|| {
            ToolError::NotFound(format!(
                "Column '{column}' not found in '{table}'. Columns: {}",
                cols.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
            ))
        })
}

fn engine_param() -> ParamSpec {
    ParamSpec::optional(
        "engine",
        ParamKind::String,
        "Database engine (sqlite or duckdb); defaults to the session's engine",
    )
}

// ============================================================================
// Tools
// ============================================================================

pub struct ExecuteSql {
    spec: ToolSpec,
}

impl ExecuteSql {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "execute_sql".to_string(),
                description: "Execute SQL against the pipeline's test database and return the results as a table (first 50 rows) or the number of rows affected.".to_string(),
                parameters: vec![
                    ParamSpec::required("query", ParamKind::String, "SQL to execute; several statements may be separated by ';'"),
                    engine_param(),
                ],
            },
        }
    }
}

impl Tool for ExecuteSql {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        ctx.check_engine(args.str("engine"))?;
        let query = args.required_str("query")?;
        let conn = ctx.connect()?;
        let outcomes = run_statements(&conn, query, Some(MAX_DISPLAY_ROWS))?;
        if outcomes.is_empty() {
            return Ok("No statements to execute.".to_string());
        }
        let parts: Vec<String> = outcomes
            .into_iter()
            .map(|o| match o {
                StatementOutcome::Affected(n) => {
                    format!("Query executed successfully. Rows affected: {n}")
                }
                StatementOutcome::Rows { result, truncated } => {
                    let mut table = result.to_table();
                    if truncated {
                        table.push_str(&format!("\n... (showing first {MAX_DISPLAY_ROWS} rows)"));
                    }
                    table
                }
            })
            .collect();
        Ok(parts.join("\n\n"))
    }
}

pub struct InspectSchema {
    spec: ToolSpec,
}

impl InspectSchema {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "inspect_schema".to_string(),
                description: "Show a table's columns, declared types, nullability and row count.".to_string(),
                parameters: vec![
                    ParamSpec::required("table_name", ParamKind::String, "Table to inspect"),
                    engine_param(),
                ],
            },
        }
    }
}

impl Tool for InspectSchema {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        ctx.check_engine(args.str("engine"))?;
        let table = args.required_str("table_name")?;
        let conn = ctx.connect()?;
        let cols = table_columns(&conn, table)?;
        let count = row_count(&conn, table)?;

        let mut lines = vec![
            format!("Table: {table}"),
            format!("Row count: {count}"),
            String::new(),
            format!("{:<20} {:<15} {:<10}", "Column", "Type", "Nullable"),
            format!("{} {} {}", "-".repeat(20), "-".repeat(15), "-".repeat(10)),
        ];
        for c in &cols {
            let mut ty = c.decl_type.clone();
            if c.primary_key {
                ty.push_str(" PK");
            }
            lines.push(format!(
                "{:<20} {:<15} {:<10}",
                c.name,
                ty,
                if c.not_null { "NO" } else { "YES" }
            ));
        }
        Ok(lines.join("\n"))
    }
}

pub struct CompareSchemas {
    spec: ToolSpec,
}

impl CompareSchemas {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "compare_schemas".to_string(),
                description: "Compare the columns of a source table and a destination table side by side, flagging missing columns and type mismatches.".to_string(),
                parameters: vec![
                    ParamSpec::required("source_table", ParamKind::String, "Source (input) table"),
                    ParamSpec::required("dest_table", ParamKind::String, "Destination (output) table"),
                    engine_param(),
                ],
            },
        }
    }
}

impl Tool for CompareSchemas {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        ctx.check_engine(args.str("engine"))?;
        let source = args.required_str("source_table")?;
        let dest = args.required_str("dest_table")?;
        let conn = ctx.connect()?;
        let diffs = compare_columns(&table_columns(&conn, source)?, &table_columns(&conn, dest)?);
        Ok(render_column_diff(source, dest, &diffs))
    }
}

pub struct SampleValues {
    spec: ToolSpec,
}

impl SampleValues {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "sample_values".to_string(),
                description: "List distinct values of a column with their stored types; useful for spotting join-key format differences and non-numeric data.".to_string(),
                parameters: vec![
                    ParamSpec::required("table_name", ParamKind::String, "Table to sample"),
                    ParamSpec::required("column", ParamKind::String, "Column to sample"),
                    ParamSpec::optional("limit", ParamKind::Integer, "Maximum distinct values (default 10, max 50)"),
                    engine_param(),
                ],
            },
        }
    }
}

impl Tool for SampleValues {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        ctx.check_engine(args.str("engine"))?;
        let table = args.required_str("table_name")?;
        let column = args.required_str("column")?;
        let limit = args
            .int("limit")
            .unwrap_or(DEFAULT_SAMPLE_LIMIT)
            .clamp(1, MAX_SAMPLE_LIMIT) as usize;

        let conn = ctx.connect()?;
        let column = require_column(&conn, table, column)?;
        let total = distinct_count(&conn, table, &column)?;
        let values = distinct_values(&conn, table, &column, limit)?;

        let mut lines = vec![format!(
            "{table}.{column}: {} of {total} distinct non-null value(s)",
            values.iter().filter(|v| **v != SqlValue::Null).count()
        )];
        for v in &values {
            lines.push(match v {
                SqlValue::Text(t) => format!("  '{t}' ({})", v.type_name()),
                other => format!("  {other} ({})", other.type_name()),
            });
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etldebug_pipeline::Engine;

    fn seeded(engine: Engine) -> DbConnection {
        let conn = DbConnection::open_in_memory(engine).expect("memory db");
        conn.execute_batch(
            "CREATE TABLE src (id TEXT, amount TEXT, region TEXT);
             CREATE TABLE dst (id INTEGER, amount REAL);
             INSERT INTO src VALUES ('1', '12.5', 'EU'), ('2', 'N/A', 'US'), ('3', '$4', 'EU');",
        )
        .expect("seed");
        conn
    }

    fn conn() -> DbConnection {
        seeded(Engine::Sqlite)
    }

    #[test]
    fn runs_multiple_statements_in_order() {
        let c = conn();
        let out = run_statements(
            &c,
            "INSERT INTO dst VALUES (1, 1.0); SELECT COUNT(*) AS n FROM dst",
            None,
        )
        .expect("run");
        assert_eq!(out[0], StatementOutcome::Affected(1));
        match &out[1] {
            StatementOutcome::Rows { result, truncated } => {
                assert!(!truncated);
                assert_eq!(result.columns, vec!["n"]);
                assert_eq!(result.rows, vec![vec![SqlValue::Integer(1)]]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn caps_rows_and_flags_truncation() {
        let c = conn();
        let out = run_statements(&c, "SELECT * FROM src", Some(2)).expect("run");
        match &out[0] {
            StatementOutcome::Rows { result, truncated } => {
                assert!(*truncated);
                assert_eq!(result.rows.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn table_rendering_pads_columns() {
        let rs = ResultSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![SqlValue::Integer(10), SqlValue::Text("x".into())]],
        };
        assert_eq!(rs.to_table(), "id | name\n---+-----\n10 | x");
        let empty = ResultSet {
            columns: vec!["id".into()],
            rows: vec![],
        };
        assert_eq!(empty.to_table(), "Columns: id\n(0 rows returned)");
    }

    #[test]
    fn missing_table_lists_available() {
        let c = conn();
        let err = table_columns(&c, "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Table 'nope' not found. Available tables: dst, src"
        );
    }

    #[test]
    fn column_diff_uses_affinity() {
        let c = conn();
        let diffs = compare_columns(
            &table_columns(&c, "src").expect("src"),
            &table_columns(&c, "dst").expect("dst"),
        );
        let status: Vec<(String, DiffStatus)> =
            diffs.iter().map(|d| (d.column.clone(), d.status)).collect();
        assert_eq!(
            status,
            vec![
                ("id".to_string(), DiffStatus::TypeDiffers),
                ("amount".to_string(), DiffStatus::TypeDiffers),
                ("region".to_string(), DiffStatus::OnlyInSource),
            ]
        );
        assert_eq!(Affinity::of("VARCHAR(20)"), Affinity::of("TEXT"));
        assert_eq!(Affinity::of("DECIMAL(10,2)"), Affinity::Numeric);
    }

    #[test]
    fn distinct_values_are_ordered() {
        let c = conn();
        let vals = distinct_values(&c, "src", "region", 10).expect("values");
        assert_eq!(
            vals,
            vec![SqlValue::Text("EU".into()), SqlValue::Text("US".into())]
        );
    }

    #[test]
    fn finds_non_numeric_text() {
        let c = conn();
        let bad = non_numeric_values(&c, "src", "amount", 100, 5).expect("values");
        assert_eq!(bad, vec!["$4".to_string(), "N/A".to_string()]);
    }

    #[test]
    fn overlap_counts_shared_keys() {
        let c = conn();
        c.execute_batch("INSERT INTO dst VALUES (1, 1.0), (7, 2.0);").expect("seed");
        assert_eq!(join_overlap(&c, "src", "id", "dst", "id").expect("overlap"), 0);
        assert_eq!(distinct_count(&c, "src", "region").expect("count"), 2);
    }

    #[test]
    fn schema_helpers_read_duckdb_catalogs() {
        let c = seeded(Engine::DuckDb);
        let cols = table_columns(&c, "SRC").expect("columns");
        assert_eq!(
            cols.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["id", "amount", "region"]
        );
        assert_eq!(cols[0].decl_type, "VARCHAR");
        assert_eq!(row_count(&c, "src").expect("count"), 3);

        let diffs = compare_columns(&cols, &table_columns(&c, "dst").expect("dst"));
        assert_eq!(diffs[0].status, DiffStatus::TypeDiffers);
        assert_eq!(diffs[2].status, DiffStatus::OnlyInSource);

        let err = table_columns(&c, "nope").unwrap_err();
        assert_eq!(err.to_string(), "Table 'nope' not found. Available tables: dst, src");
        assert_eq!(
            non_numeric_values(&c, "src", "amount", 100, 5).expect("values"),
            vec!["$4".to_string(), "N/A".to_string()]
        );
    }

    #[test]
    fn not_null_and_primary_key_flags_are_read() {
        for engine in [Engine::Sqlite, Engine::DuckDb] {
            let c = DbConnection::open_in_memory(engine).expect("memory db");
            c.execute_batch("CREATE TABLE k (id INTEGER PRIMARY KEY, name TEXT NOT NULL, note TEXT);")
                .expect("schema");
            let cols = table_columns(&c, "k").expect("columns");
            let flags: Vec<(bool, bool)> = cols.iter().map(|c| (c.not_null, c.primary_key)).collect();
            assert_eq!(flags[1..], [(true, false), (false, false)], "{engine}");
            assert!(flags[0].1, "{engine}");
        }
    }
}
