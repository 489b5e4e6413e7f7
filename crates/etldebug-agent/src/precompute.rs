//! Read-only inspections run before the first model call.
//!
//! Each inspection is independent: one that fails leaves a note and the rest
//! still run. The rendered report goes verbatim into the first user turn.

use serde::Serialize;
use tracing::debug;

use etldebug_pipeline::{analyze_transform, ColumnRef, DbConnection, PipelineConfig, TransformShape};
use etldebug_tools::sql::{
    compare_columns, distinct_count, distinct_values, join_overlap, non_numeric_values,
    render_column_diff, row_count, table_columns, Affinity, ColumnInfo,
};
use etldebug_tools::{SqlValue, ToolContext};

const JOIN_SAMPLE: usize = 5;
const NUMERIC_SCAN: usize = 500;
const NUMERIC_SAMPLE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSection {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub sections: Vec<DiagnosticSection>,
    pub notes: Vec<String>,
}

impl DiagnosticsReport {
    fn section(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.sections.push(DiagnosticSection {
            title: title.into(),
            body: body.into(),
        });
    }

    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.notes.is_empty()
    }

    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .sections
            .iter()
            .map(|s| format!("### {}\n{}", s.title, s.body.trim_end()))
            .collect();
        if !self.notes.is_empty() {
            let notes: Vec<String> = self.notes.iter().map(|n| format!("- {n}")).collect();
            parts.push(format!("### Notes\n{}", notes.join("\n")));
        }
        parts.join("\n\n")
    }
}

fn render_value(v: &SqlValue) -> String {
    match v {
        SqlValue::Text(t) => format!("'{t}'"),
        other => other.to_string(),
    }
}

fn render_columns(cols: &[ColumnInfo], rows: Option<i64>) -> String {
    let mut lines: Vec<String> = cols
        .iter()
        .map(|c| {
            let ty = if c.decl_type.is_empty() { "(none)" } else { c.decl_type.as_str() };
            let nn = if c.not_null { " NOT NULL" } else { "" };
            format!("  {} {ty}{nn}", c.name)
        })
        .collect();
    if let Some(n) = rows {
        lines.push(format!("  ({n} rows)"));
    }
    lines.join("\n")
}

/// Source tables: declared ones, else the FROM/JOIN tables of the transform.
fn source_tables(pipeline: &PipelineConfig, shape: &TransformShape) -> Vec<String> {
    let declared = pipeline.declared_source_tables();
    if declared.is_empty() {
        shape.source_table_names()
    } else {
        declared
    }
}

pub fn precompute(pipeline: &PipelineConfig, ctx: &ToolContext) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::default();
    let conn = match ctx.connect() {
        Ok(c) => c,
        Err(e) => {
            report.note(format!("could not open the test database: {e}"));
            return report;
        }
    };

    let shape = analyze_transform(&pipeline.transform.sql);
    if shape.heuristic {
        report.note("the transform SQL did not parse; tables and join keys were found by pattern matching");
    }

    let dest = pipeline.destination.table.as_str();
    let dest_cols = match table_columns(&conn, dest) {
        Ok(cols) => {
            let rows = row_count(&conn, dest).ok();
            report.section(
                format!("Destination table {dest}"),
                render_columns(&cols, rows),
            );
            Some(cols)
        }
        Err(e) => {
            report.note(format!("destination table: {e}"));
            None
        }
    };

    let sources = source_tables(pipeline, &shape);
    for src in &sources {
        let src_cols = match table_columns(&conn, src) {
            Ok(cols) => cols,
            Err(e) => {
                report.note(format!("source table: {e}"));
                continue;
            }
        };
        match &dest_cols {
            Some(dcols) => {
                let diffs = compare_columns(&src_cols, dcols);
                report.section(
                    format!("Schema comparison {src} -> {dest}"),
                    render_column_diff(src, dest, &diffs),
                );
            }
            None => {
                let rows = row_count(&conn, src).ok();
                report.section(format!("Source table {src}"), render_columns(&src_cols, rows));
            }
        }
    }

    for key in &shape.join_keys {
        let (Some(lt), Some(rt)) = (key.left.table.as_deref(), key.right.table.as_deref()) else {
            report.note(format!(
                "join key {} = {}: could not tell which tables the columns belong to",
                key.left.column, key.right.column
            ));
            continue;
        };
        match join_key_section(&conn, lt, &key.left.column, rt, &key.right.column) {
            Ok(body) => report.section(
                format!("Join key {lt}.{} = {rt}.{}", key.left.column, key.right.column),
                body,
            ),
            Err(e) => report.note(format!(
                "join key {lt}.{} = {rt}.{}: {e}",
                key.left.column, key.right.column
            )),
        }
    }

    if let Some(dcols) = &dest_cols {
        let lines = numeric_feed_lines(&conn, &shape, &sources, dcols, &mut report);
        if !lines.is_empty() {
            report.section("Non-numeric values feeding numeric columns", lines.join("\n"));
        }
    }

    debug!(
        sections = report.sections.len(),
        notes = report.notes.len(),
        "diagnostics precomputed"
    );
    report
}

fn join_key_section(
    conn: &DbConnection,
    lt: &str,
    lc: &str,
    rt: &str,
    rc: &str,
) -> Result<String, etldebug_tools::ToolError> {
    let mut lines = Vec::new();
    for (table, column) in [(lt, lc), (rt, rc)] {
        let values = distinct_values(conn, table, column, JOIN_SAMPLE)?;
        let total = distinct_count(conn, table, column)?;
        let shown: Vec<String> = values.iter().map(render_value).collect();
        lines.push(format!(
            "{table}.{column}: {} ({total} distinct)",
            shown.join(", ")
        ));
    }
    let overlap = join_overlap(conn, lt, lc, rt, rc)?;
    lines.push(format!("Values present on both sides: {overlap}"));
    if overlap == 0 {
        lines.push("No key value matches across the join; compare the formats above.".to_string());
    }
    Ok(lines.join("\n"))
}

fn resolve_source(col: &ColumnRef, sources: &[String]) -> Option<String> {
    match &col.table {
        Some(t) => Some(t.clone()),
        None if sources.len() == 1 => Some(sources[0].clone()),
        None => None,
    }
}

fn numeric_feed_lines(
    conn: &DbConnection,
    shape: &TransformShape,
    sources: &[String],
    dest_cols: &[ColumnInfo],
    report: &mut DiagnosticsReport,
) -> Vec<String> {
    let mut lines = Vec::new();
    for mapping in &shape.column_mappings {
        let Some(dcol) = dest_cols
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&mapping.dest_column))
        else {
            continue;
        };
        let affinity = Affinity::of(&dcol.decl_type);
        if !affinity.is_numeric() {
            continue;
        }
        let Some(table) = resolve_source(&mapping.source, sources) else {
            continue;
        };
        let column = &mapping.source.column;
        match non_numeric_values(conn, &table, column, NUMERIC_SCAN, NUMERIC_SAMPLE) {
            Ok(bad) if !bad.is_empty() => {
                let shown: Vec<String> = bad.iter().map(|b| format!("'{b}'")).collect();
                lines.push(format!(
                    "{table}.{column} -> {}.{} ({}): {}",
                    shape.target_table.as_deref().unwrap_or("destination"),
                    dcol.name,
                    dcol.decl_type,
                    shown.join(", ")
                ));
            }
            Ok(_) => {}
            Err(e) => report.note(format!("numeric check on {table}.{column}: {e}")),
        }
    }
    lines
}
