//! One connection type over the engines a pipeline can target.
//!
//! SQLite goes through `rusqlite`, DuckDB through `duckdb`. Callers see the
//! same [`SqlValue`]/[`ResultSet`] shapes either way.

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::config::Engine;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),
}

// ============================================================================
// Values and result sets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            SqlValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<rusqlite::types::ValueRef<'_>> for SqlValue {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl From<duckdb::types::Value> for SqlValue {
    fn from(v: duckdb::types::Value) -> Self {
        use duckdb::types::Value;
        match v {
            Value::Null => SqlValue::Null,
            Value::Boolean(b) => SqlValue::Integer(i64::from(b)),
            Value::TinyInt(n) => SqlValue::Integer(n.into()),
            Value::SmallInt(n) => SqlValue::Integer(n.into()),
            Value::Int(n) => SqlValue::Integer(n.into()),
            Value::BigInt(n) => SqlValue::Integer(n),
            Value::UTinyInt(n) => SqlValue::Integer(n.into()),
            Value::USmallInt(n) => SqlValue::Integer(n.into()),
            Value::UInt(n) => SqlValue::Integer(n.into()),
            Value::UBigInt(n) => i64::try_from(n)
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(n.to_string())),
            Value::HugeInt(n) => i64::try_from(n)
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(n.to_string())),
            Value::Float(f) => SqlValue::Real(f.into()),
            Value::Double(f) => SqlValue::Real(f),
            Value::Decimal(d) => {
                let text = d.to_string();
                text.parse().map(SqlValue::Real).unwrap_or(SqlValue::Text(text))
            }
            Value::Text(t) | Value::Enum(t) => SqlValue::Text(t),
            Value::Blob(b) => SqlValue::Blob(b),
            Value::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
                .map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(SqlValue::Integer(days.into())),
            other => SqlValue::Text(format!("{other:?}")),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(t) => f.write_str(t),
            SqlValue::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    /// Fixed-width text table.
    pub fn to_table(&self) -> String {
        if self.rows.is_empty() {
            return format!("Columns: {}\n(0 rows returned)", self.columns.join(", "));
        }
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(ToString::to_string).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                cells
                    .iter()
                    .filter_map(|r| r.get(i))
                    .map(|s| s.chars().count())
                    .chain(std::iter::once(c.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |values: &[String]| -> String {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{v:<w$}", w = *w))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };
        let mut out = vec![line(&self.columns)];
        out.push(
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        out.extend(cells.iter().map(|r| line(r)));
        out.join("\n")
    }

    /// First cell of the first row.
    pub fn first_value(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Rows { result: ResultSet, truncated: bool },
    Affected(usize),
}

// ============================================================================
// Connections
// ============================================================================

pub enum DbConnection {
    Sqlite(rusqlite::Connection),
    DuckDb(duckdb::Connection),
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbConnection({})", self.engine())
    }
}

impl DbConnection {
    pub fn open(engine: Engine, path: &Path) -> Result<Self, DbError> {
        Ok(match engine {
            Engine::Sqlite => DbConnection::Sqlite(rusqlite::Connection::open(path)?),
            Engine::DuckDb => DbConnection::DuckDb(duckdb::Connection::open(path)?),
        })
    }

    pub fn open_in_memory(engine: Engine) -> Result<Self, DbError> {
        Ok(match engine {
            Engine::Sqlite => DbConnection::Sqlite(rusqlite::Connection::open_in_memory()?),
            Engine::DuckDb => DbConnection::DuckDb(duckdb::Connection::open_in_memory()?),
        })
    }

    pub fn engine(&self) -> Engine {
        match self {
            DbConnection::Sqlite(_) => Engine::Sqlite,
            DbConnection::DuckDb(_) => Engine::DuckDb,
        }
    }

    /// Run a script for its side effects only.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        match self {
            DbConnection::Sqlite(conn) => conn.execute_batch(sql)?,
            DbConnection::DuckDb(conn) => conn.execute_batch(sql)?,
        }
        Ok(())
    }

    /// Run every statement in `sql` in order, stopping at the first error.
    ///
    /// Statements that produce rows are read (up to `row_cap` rows when
    /// given); everything else reports rows affected.
    pub fn run_statements(
        &self,
        sql: &str,
        row_cap: Option<usize>,
    ) -> Result<Vec<StatementOutcome>, DbError> {
        match self {
            DbConnection::Sqlite(conn) => sqlite_statements(conn, sql, row_cap),
            DbConnection::DuckDb(conn) => duckdb_statements(conn, sql, row_cap),
        }
    }

    /// The last result set `sql` produced, empty when it produced none.
    pub fn query(&self, sql: &str) -> Result<ResultSet, DbError> {
        Ok(self
            .run_statements(sql, None)?
            .into_iter()
            .rev()
            .find_map(|o| match o {
                StatementOutcome::Rows { result, .. } => Some(result),
                StatementOutcome::Affected(_) => None,
            })
            .unwrap_or_default())
    }

    /// A single integral cell, e.g. `SELECT COUNT(*) ...`.
    pub fn query_i64(&self, sql: &str) -> Result<i64, DbError> {
        Ok(self
            .query(sql)?
            .first_value()
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }

    /// User tables and views, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>, DbError> {
        let sql = match self {
            DbConnection::Sqlite(_) => {
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            DbConnection::DuckDb(_) => {
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'main' ORDER BY table_name"
            }
        };
        Ok(self
            .query(sql)?
            .rows
            .into_iter()
            .filter_map(|r| r.into_iter().next())
            .map(|v| v.to_string())
            .collect())
    }

    /// Create `table` with every column TEXT and insert `records` verbatim,
    /// in one transaction. Short records are padded with empty strings.
    pub fn load_text_table(
        &mut self,
        table: &str,
        headers: &[String],
        records: &[Vec<String>],
    ) -> Result<(), DbError> {
        let col_defs = headers
            .iter()
            .map(|h| format!("{} TEXT", crate::quote_ident(h)))
            .collect::<Vec<_>>()
            .join(", ");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({col_defs})",
            crate::quote_ident(table)
        );
        let insert = format!(
            "INSERT INTO {} VALUES ({})",
            crate::quote_ident(table),
            vec!["?"; headers.len()].join(", ")
        );
        let padded = |record: &Vec<String>| -> Vec<String> {
            (0..headers.len())
                .map(|i| record.get(i).cloned().unwrap_or_default())
                .collect()
        };

        match self {
            DbConnection::Sqlite(conn) => {
                let tx = conn.transaction()?;
                tx.execute(&create, [])?;
                {
                    let mut stmt = tx.prepare(&insert)?;
                    for record in records {
                        stmt.execute(rusqlite::params_from_iter(padded(record)))?;
                    }
                }
                tx.commit()?;
            }
            DbConnection::DuckDb(conn) => {
                let tx = conn.transaction()?;
                tx.execute(&create, [])?;
                {
                    let mut stmt = tx.prepare(&insert)?;
                    for record in records {
                        stmt.execute(duckdb::params_from_iter(padded(record)))?;
                    }
                }
                tx.commit()?;
            }
        }
        Ok(())
    }
}

fn sqlite_statements(
    conn: &rusqlite::Connection,
    sql: &str,
    row_cap: Option<usize>,
) -> Result<Vec<StatementOutcome>, DbError> {
    let mut outcomes = Vec::new();
    let mut batch = rusqlite::Batch::new(conn, sql);
    while let Some(mut stmt) = batch.next()? {
        if stmt.column_count() == 0 {
            outcomes.push(StatementOutcome::Affected(stmt.execute([])?));
            continue;
        }
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = stmt.query([])?;
        let mut out_rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next()? {
            if row_cap.is_some_and(|cap| out_rows.len() >= cap) {
                truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            out_rows.push(values);
        }
        outcomes.push(StatementOutcome::Rows {
            result: ResultSet {
                columns,
                rows: out_rows,
            },
            truncated,
        });
    }
    Ok(outcomes)
}

fn duckdb_statements(
    conn: &duckdb::Connection,
    sql: &str,
    row_cap: Option<usize>,
) -> Result<Vec<StatementOutcome>, DbError> {
    let mut outcomes = Vec::new();
    for text in split_statements(sql) {
        let mut stmt = conn.prepare(text)?;
        if !returns_rows(text) {
            outcomes.push(StatementOutcome::Affected(stmt.execute([])?));
            continue;
        }
        let mut rows = stmt.query([])?;
        // Column metadata only exists once the statement has run.
        let columns: Vec<String> = rows
            .as_ref()
            .map(|s| s.column_names())
            .unwrap_or_default();
        let width = columns.len();
        let mut out_rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next()? {
            if row_cap.is_some_and(|cap| out_rows.len() >= cap) {
                truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get::<_, duckdb::types::Value>(i)?));
            }
            out_rows.push(values);
        }
        outcomes.push(StatementOutcome::Rows {
            result: ResultSet {
                columns,
                rows: out_rows,
            },
            truncated,
        });
    }
    Ok(outcomes)
}

// ============================================================================
// Statement text
// ============================================================================

/// Words that begin a row-returning statement.
const QUERY_WORDS: &[&str] = &[
    "select", "values", "from", "table", "pragma", "show", "describe", "explain", "summarize",
];

/// Words that begin a data-changing statement once a `WITH` clause is skipped.
const DML_WORDS: &[&str] = &["insert", "update", "delete", "merge"];

/// Splits a script on top-level `;`, ignoring semicolons inside quotes and
/// comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    scan(sql, |i, token| {
        if let Token::Semicolon = token {
            let piece = sql[start..i].trim();
            if !piece.is_empty() && !only_comments(piece) {
                out.push(piece);
            }
            start = i + 1;
        }
        true
    });
    let rest = sql[start..].trim();
    if !rest.is_empty() && !only_comments(rest) {
        out.push(rest);
    }
    out
}

/// Whether a single statement yields a result set rather than a row count.
pub fn returns_rows(statement: &str) -> bool {
    let mut in_with = false;
    let mut verdict = false;
    scan(statement, |_, token| {
        let Token::Word(word, depth) = token else {
            return true;
        };
        let word = word.to_ascii_lowercase();
        if !in_with {
            if word == "with" {
                in_with = true;
                return true;
            }
            verdict = QUERY_WORDS.contains(&word.as_str());
            return false;
        }
        // After `WITH`, the first top-level statement word decides.
        if depth > 0 {
            return true;
        }
        if word == "select" || DML_WORDS.contains(&word.as_str()) {
            verdict = word == "select";
            return false;
        }
        true
    });
    verdict
}

fn only_comments(text: &str) -> bool {
    let mut any = false;
    scan(text, |_, token| {
        any = !matches!(token, Token::Semicolon);
        !any
    });
    !any
}

enum Token<'a> {
    Word(&'a str, usize),
    Semicolon,
    Other,
}

/// Walks `sql` outside string literals, quoted identifiers and comments.
/// The callback gets the byte offset and token; returning false stops.
fn scan<'a>(sql: &'a str, mut f: impl FnMut(usize, Token<'a>) -> bool) {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let token_start = i;
        let token = match c {
            b'\'' | b'"' | b'`' => {
                i = skip_quoted(bytes, i, c);
                Token::Other
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                continue;
            }
            b';' => {
                i += 1;
                Token::Semicolon
            }
            b'(' => {
                depth += 1;
                i += 1;
                Token::Other
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
                Token::Other
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                Token::Word(&sql[token_start..i], depth)
            }
            c if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            _ => {
                i += 1;
                Token::Other
            }
        };
        if !f(token_start, token) {
            return;
        }
    }
}

/// Index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}
