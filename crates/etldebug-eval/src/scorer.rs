//! Deterministic grading of one diagnosis against one golden-set case.
//!
//! Two independent verdicts:
//! - root cause: keyword overlap with the expected explanation
//! - fix validity: the proposed SQL applied to a private copy of the
//!   case database, then checked by the verification query
//!
//! Step count and wall-clock time are recorded by the runner and never gate
//! either verdict.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use etldebug_agent::Diagnosis;
use etldebug_pipeline::{ExpectedFix, ExpectedResult, SandboxDb};
use etldebug_tools::sql::query_result_set;
use etldebug_tools::{apply_fix, FixOutcome, ResultSet, SqlValue};

/// Minimum share of expected terms the prediction must contain.
pub const PASS_THRESHOLD: f64 = 0.5;

const NUMERIC_TOLERANCE: f64 = 1e-6;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall", "to",
    "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "but", "or", "and", "not",
    "no", "it", "its", "that", "this", "which", "what", "who", "how", "when", "where", "why",
    "all", "each", "both", "few", "more",
];

// ============================================================================
// Root cause
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootCauseScore {
    pub ratio: f64,
    pub passed: bool,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
}

fn word_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9_]+").ok()).as_ref()
}

/// Lowercased keywords longer than one character, stopwords removed.
pub fn extract_terms(text: &str) -> BTreeSet<String> {
    let Some(re) = word_regex() else {
        return BTreeSet::new();
    };
    let lower = text.to_lowercase();
    re.find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

pub fn score_root_cause(predicted: &str, expected: &str) -> RootCauseScore {
    let predicted_terms = extract_terms(predicted);
    let expected_terms = extract_terms(expected);

    let (matched, missing): (Vec<String>, Vec<String>) = expected_terms
        .iter()
        .cloned()
        .partition(|t| predicted_terms.contains(t));

    if predicted_terms.is_empty() || expected_terms.is_empty() {
        return RootCauseScore {
            ratio: 0.0,
            passed: false,
            matched: Vec::new(),
            missing,
        };
    }

    let ratio = matched.len() as f64 / expected_terms.len() as f64;
    RootCauseScore {
        ratio,
        passed: ratio >= PASS_THRESHOLD,
        matched,
        missing,
    }
}

// ============================================================================
// Fix validity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixScore {
    pub passed: bool,
    /// Why the verdict came out the way it did.
    pub detail: String,
}

impl FixScore {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Applies the diagnosis' fix to a fork of `pristine` and verifies it.
///
/// The case's own verification query takes precedence; the diagnosis' query
/// is used only when the case has none.
pub fn score_fix(pristine: &SandboxDb, diagnosis: &Diagnosis, expected: &ExpectedFix) -> FixScore {
    let Some(fixed_sql) = diagnosis.fixed_sql.as_deref().filter(|s| !s.trim().is_empty()) else {
        return FixScore::fail("no fixed SQL was proposed");
    };

    let scratch = match pristine.fork() {
        Ok(db) => db,
        Err(e) => return FixScore::fail(format!("could not copy the case database: {e}")),
    };

    if let FixOutcome::Failed { error } = apply_fix(&scratch, fixed_sql, None) {
        return FixScore::fail(format!("fix failed to apply: {error}"));
    }

    let query = Some(expected.verification_query.trim())
        .filter(|q| !q.is_empty())
        .or_else(|| {
            diagnosis
                .verification_query
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
        });
    let Some(query) = query else {
        return FixScore::pass("fix applied; no verification query to run");
    };

    let actual = match scratch
        .connect()
        .map_err(|e| e.to_string())
        .and_then(|conn| query_result_set(&conn, query).map_err(|e| e.to_string()))
    {
        Ok(rs) => rs,
        Err(e) => return FixScore::fail(format!("verification query failed: {e}")),
    };

    if let Some(result) = &expected.expected_result {
        return match compare_result(&actual, result) {
            Ok(()) => FixScore::pass(format!(
                "verification matched the expected result ({} rows)",
                actual.rows.len()
            )),
            Err(why) => FixScore::fail(format!("verification mismatch: {why}")),
        };
    }

    if let Some(min) = expected.expected_row_count_min {
        let observed = single_count(&actual).unwrap_or(actual.rows.len() as i64);
        return if observed >= min as i64 {
            FixScore::pass(format!("verification returned {observed} (minimum {min})"))
        } else {
            FixScore::fail(format!("verification returned {observed}, expected at least {min}"))
        };
    }

    FixScore::pass(format!("verification query ran ({} rows)", actual.rows.len()))
}

/// A `SELECT COUNT(*)`-style result: one row, one integral cell.
fn single_count(rs: &ResultSet) -> Option<i64> {
    match rs.rows.as_slice() {
        [row] if row.len() == 1 => match &row[0] {
            SqlValue::Integer(n) => Some(*n),
            SqlValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Structural and value equality; row order does not matter.
pub fn compare_result(actual: &ResultSet, expected: &ExpectedResult) -> Result<(), String> {
    if let Some(columns) = &expected.columns {
        if columns.len() != actual.columns.len() {
            return Err(format!(
                "expected {} columns, got {}",
                columns.len(),
                actual.columns.len()
            ));
        }
        for (want, got) in columns.iter().zip(&actual.columns) {
            if !want.eq_ignore_ascii_case(got) {
                return Err(format!("expected column `{want}`, got `{got}`"));
            }
        }
    }

    if actual.rows.len() != expected.rows.len() {
        return Err(format!(
            "expected {} rows, got {}",
            expected.rows.len(),
            actual.rows.len()
        ));
    }

    let mut remaining: Vec<&Vec<SqlValue>> = actual.rows.iter().collect();
    for want in &expected.rows {
        if want.len() != actual.columns.len() {
            return Err(format!(
                "expected row {} has {} values but the result has {} columns",
                render_row(want),
                want.len(),
                actual.columns.len()
            ));
        }
        let Some(pos) = remaining.iter().position(|got| row_matches(got, want)) else {
            return Err(format!("no result row matches {}", render_row(want)));
        };
        remaining.swap_remove(pos);
    }
    Ok(())
}

fn row_matches(got: &[SqlValue], want: &[Value]) -> bool {
    got.len() == want.len() && got.iter().zip(want).all(|(g, w)| value_matches(g, w))
}

fn as_number(v: &SqlValue) -> Option<f64> {
    match v {
        SqlValue::Integer(n) => Some(*n as f64),
        SqlValue::Real(f) => Some(*f),
        // CSV-loaded columns are TEXT.
        SqlValue::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn value_matches(got: &SqlValue, want: &Value) -> bool {
    match want {
        Value::Null => matches!(got, SqlValue::Null),
        Value::Number(n) => match (as_number(got), n.as_f64()) {
            (Some(g), Some(w)) => (g - w).abs() <= NUMERIC_TOLERANCE,
            _ => false,
        },
        Value::Bool(b) => as_number(got) == Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match got {
            SqlValue::Text(t) => t == s,
            SqlValue::Integer(_) | SqlValue::Real(_) => got.to_string() == *s,
            _ => false,
        },
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn render_row(row: &[Value]) -> String {
    let cells: Vec<String> = row.iter().map(Value::to_string).collect();
    format!("[{}]", cells.join(", "))
}
