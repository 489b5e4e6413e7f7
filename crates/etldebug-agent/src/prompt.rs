//! Prompt text for the diagnosis session.

use std::path::Path;

use etldebug_pipeline::PipelineConfig;
use etldebug_tools::ToolCatalogue;

pub const SYSTEM_PROMPT: &str = r#"You are an ETL pipeline debugger. You find out why a data pipeline failed and propose a SQL fix.

Use at least two tools before you answer. The error log can be misleading; confirm every claim against the database.

## Diagnostic checklist
1. Inspect the destination table: every column name and declared type.
2. Inspect each source table the same way.
3. Compare source and destination side by side:
   - column names that differ (source "total_amount", destination "amount")
   - declared types that differ (TEXT feeding a REAL or INTEGER column)
   - destination columns with no source at all
4. When the transform joins tables and the log reports 0 rows, sample DISTINCT values of the join key on both sides and compare their formats (101 versus 'CUST-101').
5. Test your corrected SELECT before writing the final statement.
6. Finish with the fix and a query that verifies it.

## Known bug patterns
1. COLUMN NAME MISMATCH. The source column is named differently from the destination column.
   Fix: select source_col AS dest_col and list destination names in the INSERT column list.
2. MISSING COLUMN. A column the load needs does not exist on one side.
   Fix: add it (ALTER TABLE ... ADD COLUMN) or supply a default such as 'UNKNOWN' AS missing_col.
3. TYPE CAST ERROR. Text values hold non-numeric content ("$12.50", "N/A").
   Fix: CASE WHEN col = 'N/A' THEN NULL ELSE CAST(REPLACE(col, '$', '') AS REAL) END.
   Check every sample value for every non-conforming pattern, not only the first one.
4. JOIN KEY FORMAT MISMATCH. The join matches nothing because key formats differ.
   Fix: normalize one side, e.g. CAST(REPLACE(c.id, 'CUST-', '') AS INTEGER).

## Writing ROOT_CAUSE
Be specific. Name the exact columns and tables involved, the kind of problem (column name mismatch, missing column, type cast error, join key format mismatch) and both types when types differ.

When you are done, answer in exactly this format, without code fences:

ROOT_CAUSE: <one line: columns, tables and the nature of the problem>
FIX_TYPE: sql_modification
FIX_DESCRIPTION: <what changes>
FIXED_SQL:
<the corrected SQL, raw>
VERIFICATION_QUERY:
<a SELECT that shows the fix worked, raw>"#;

/// Appended to the system prompt when tools are described in text.
pub fn structured_tool_instructions(catalogue: &ToolCatalogue) -> String {
    let example = catalogue
        .specs()
        .first()
        .map(|s| s.name.as_str())
        .unwrap_or("execute_sql");
    format!(
        "## Tools\n{}\nTo call a tool, put exactly one line in this form in your reply:\nTOOL_CALL: {{\"tool\": \"<tool_name>\", \"args\": {{\"<arg>\": \"<value>\"}}}}\n\nExample:\nTOOL_CALL: {{\"tool\": \"{example}\", \"args\": {{\"query\": \"SELECT * FROM orders LIMIT 3\"}}}}\n\nRules:\n- Call ONE tool at a time and wait for its result.\n- Inspect schemas before diagnosing.\n- Give the final diagnosis only when you no longer need tools.",
        catalogue.describe()
    )
}

/// Sent after a reply that was neither a tool call nor a diagnosis.
pub const FORMAT_REMINDER: &str = "Your last reply was neither a tool call nor a final diagnosis. Either call one tool, or answer with ROOT_CAUSE:, FIX_TYPE:, FIX_DESCRIPTION:, FIXED_SQL: and VERIFICATION_QUERY: lines.";

/// Regular files directly inside `dir`, sorted by name.
pub fn list_case_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}

/// The first user turn: pipeline, error log, readable files, precomputed
/// diagnostics.
pub fn build_user_prompt(
    pipeline: &PipelineConfig,
    error_log: &str,
    case_dir: Option<&Path>,
    diagnostics: Option<&str>,
) -> String {
    let engine = pipeline.destination.engine.as_str();
    let mut parts: Vec<String> = vec![
        "I have a broken ETL pipeline that needs debugging.".to_string(),
        String::new(),
        "## Pipeline Configuration".to_string(),
        format!("Name: {}", pipeline.name),
        format!("Source type: {}", pipeline.source.kind),
    ];
    let tables = pipeline.declared_source_tables();
    if !tables.is_empty() {
        parts.push(format!("Source tables: {}", tables.join(", ")));
    }
    parts.extend([
        format!("Destination engine: {engine}"),
        format!("Destination table: {}", pipeline.destination.table),
        String::new(),
        "Transform SQL:".to_string(),
        "```sql".to_string(),
        pipeline.transform.sql.trim().to_string(),
        "```".to_string(),
        String::new(),
        "## Error Log".to_string(),
        "```".to_string(),
        if error_log.trim().is_empty() {
            "(no error log provided)".to_string()
        } else {
            error_log.trim().to_string()
        },
        "```".to_string(),
    ]);

    if let Some(dir) = case_dir {
        let files = list_case_files(dir);
        parts.extend([
            String::new(),
            "## Available Files".to_string(),
            "Paths are relative to the case directory and can be passed to read_file.".to_string(),
            format!("Files: {}", files.join(", ")),
        ]);
    }

    if let Some(diag) = diagnostics.map(str::trim).filter(|d| !d.is_empty()) {
        parts.extend([
            String::new(),
            "## Precomputed Diagnostics".to_string(),
            diag.to_string(),
        ]);
    }

    parts.extend([
        String::new(),
        format!(
            "The database engine is {engine}. Pass engine='{engine}' when a tool accepts one."
        ),
        String::new(),
        "Please diagnose the root cause and propose a fix.".to_string(),
    ]);
    parts.join("\n")
}
