//! Best-effort recovery for replies the parser could not classify.
//!
//! Looks for SQL (fenced or bare) and for a sentence that reads like a
//! diagnosis. Anything it returns is marked degraded.

use std::sync::OnceLock;

use regex::Regex;

use crate::json;
use crate::parser::FinalAnswer;

const CUES: &[&str] = &[
    "root cause",
    "the issue",
    "the problem",
    "caused by",
    "because",
    "mismatch",
    "missing",
    "does not exist",
    "doesn't exist",
    "no such column",
    "not found",
    "differ",
    "format",
    "cast",
];

/// Phrases that state a conclusion rather than a plan.
const STRONG_CUES: &[&str] = &[
    "root cause",
    "the issue is",
    "the problem is",
    "caused by",
    "no such column",
];

const MAX_ROOT_CAUSE_CHARS: usize = 300;

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn is_modifying(sql: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &RE,
        r"(?i)^\s*(insert|update|delete|alter|create|replace|drop)\b",
    )
    .is_some_and(|re| re.is_match(sql))
}

fn is_query(sql: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?i)^\s*(select|with)\b").is_some_and(|re| re.is_match(sql))
}

fn starts_statement(line: &str) -> bool {
    is_modifying(line) || is_query(line)
}

/// Removes `TOOL_CALL:` markers and the JSON that follows them.
pub(crate) fn strip_tool_calls(text: &str) -> String {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(marker) = cached(&MARKER, r"(?i)TOOL_CALL\s*:") else {
        return text.to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in marker.find_iter(text) {
        if m.start() < cursor {
            continue;
        }
        out.push_str(&text[cursor..m.start()]);
        cursor = match json::balanced_object_span(text, m.end()) {
            Some((_, end)) => end,
            None => text[m.end()..]
                .find('\n')
                .map_or(text.len(), |nl| m.end() + nl),
        };
    }
    out.push_str(&text[cursor..]);
    out
}

/// Splits text into SQL blocks and the prose around them.
fn split_sql(text: &str) -> (Vec<String>, String) {
    let mut blocks = Vec::new();
    let mut prose = String::new();

    let mut fenced: Option<Vec<&str>> = None;
    let mut bare: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            match fenced.take() {
                Some(body) => blocks.push(body.join("\n").trim().to_string()),
                None => {
                    if let Some(body) = bare.take() {
                        blocks.push(body.join("\n").trim().to_string());
                    }
                    fenced = Some(Vec::new());
                }
            }
            continue;
        }
        if let Some(body) = fenced.as_mut() {
            body.push(line);
            continue;
        }
        if let Some(body) = bare.as_mut() {
            if trimmed.is_empty() {
                if let Some(body) = bare.take() {
                    blocks.push(body.join("\n").trim().to_string());
                }
                continue;
            }
            body.push(line);
            continue;
        }
        if starts_statement(trimmed) {
            bare = Some(vec![line]);
            continue;
        }
        prose.push_str(line);
        prose.push('\n');
    }
    if let Some(body) = fenced.or(bare) {
        blocks.push(body.join("\n").trim().to_string());
    }
    blocks.retain(|b| !b.is_empty());
    (blocks, prose)
}

fn diagnosis_sentence(prose: &str) -> Option<String> {
    static SENTENCE_END: OnceLock<Option<Regex>> = OnceLock::new();
    // A period inside `table.column` does not end a sentence.
    let re = cached(&SENTENCE_END, r"[.!?](?:\s+|$)|\n")?;
    re.split(prose)
        .map(|s| s.trim().trim_start_matches(['-', '*', '#', ' ']).trim())
        .filter(|s| s.len() > 10)
        .find(|s| {
            let lower = s.to_lowercase();
            CUES.iter().any(|cue| lower.contains(cue))
        })
        .map(|s| s.chars().take(MAX_ROOT_CAUSE_CHARS).collect())
}

pub fn salvage(raw: &str) -> Option<FinalAnswer> {
    let text = strip_tool_calls(raw);
    let (blocks, prose) = split_sql(&text);

    let fixed_sql = blocks.iter().find(|b| is_modifying(b)).cloned();
    let verification_query = blocks.iter().find(|b| is_query(b)).cloned();
    let root_cause = diagnosis_sentence(&prose).unwrap_or_default();

    if root_cause.is_empty() && fixed_sql.is_none() {
        return None;
    }
    Some(FinalAnswer {
        root_cause,
        fix_type: None,
        fix_description: String::new(),
        fixed_sql,
        verification_query,
        degraded: true,
    })
}

/// Whether a salvaged answer is enough to end a session early: it carries a
/// fix, or its root cause states a conclusion. Planning prose ("I should
/// check whether the column is missing") is not.
pub fn is_conclusive(answer: &FinalAnswer) -> bool {
    if answer.fixed_sql.is_some() {
        return true;
    }
    let lower = answer.root_cause.to_lowercase();
    STRONG_CUES.iter().any(|cue| lower.contains(cue))
}
