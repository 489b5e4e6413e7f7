//! Classifies one model response.
//!
//! The parser is an ordered chain of attempts. Each looks at the response
//! and either claims it or passes it on:
//!
//! 1. tool calls the backend returned natively
//! 2. trivial replies (`""`, `{}`, `null`, `[]`), which are never answers
//! 3. a tool call embedded in text (`TOOL_CALL: {...}` or a bare call object)
//! 4. a JSON final answer
//! 5. labelled fields (`ROOT_CAUSE:`, `FIXED_SQL:`, ...)
//!
//! Whatever is left is [`ParsedResponse::Unparseable`]. Tool calls are tried
//! before answers, so a reply that does both is treated as a tool request.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use etldebug_tools::ToolInvocationRequest;

use crate::fallback;
use crate::gateway::{ModelResponse, ToolMode};
use crate::json;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub root_cause: String,
    pub fix_type: Option<String>,
    pub fix_description: String,
    pub fixed_sql: Option<String>,
    pub verification_query: Option<String>,
    /// Recovered by best-effort extraction rather than a well-formed answer.
    #[serde(default)]
    pub degraded: bool,
}

impl FinalAnswer {
    fn is_substantive(&self) -> bool {
        !self.root_cause.trim().is_empty() || self.fixed_sql.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    ToolCalls(Vec<ToolInvocationRequest>),
    FinalAnswer(FinalAnswer),
    Unparseable { raw: String },
}

pub enum Attempt {
    Parsed(ParsedResponse),
    Next,
}

pub trait ParseAttempt: Send + Sync {
    fn name(&self) -> &'static str;

    fn attempt(&self, response: &ModelResponse) -> Attempt;
}

pub struct ResponseParser {
    attempts: Vec<Box<dyn ParseAttempt>>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.attempts.iter().map(|a| a.name()).collect();
        f.debug_struct("ResponseParser").field("attempts", &names).finish()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            attempts: vec![
                Box::new(NativeCalls),
                Box::new(TrivialGuard),
                Box::new(EmbeddedToolCall),
                Box::new(JsonFinalAnswer),
                Box::new(LabelledFields),
            ],
        }
    }

    pub fn parse(&self, response: &ModelResponse) -> ParsedResponse {
        for attempt in &self.attempts {
            if let Attempt::Parsed(parsed) = attempt.attempt(response) {
                tracing::debug!(attempt = attempt.name(), "response classified");
                return parsed;
            }
        }
        ParsedResponse::Unparseable {
            raw: response.text.clone(),
        }
    }
}

/// Labelled answer fields in `text`, with any embedded tool calls removed
/// first. Used on the last reply of an exhausted session, where a tool call
/// and a written-out answer may share one message.
pub fn labelled_answer(text: &str) -> Option<FinalAnswer> {
    let response = ModelResponse {
        mode: ToolMode::Structured,
        text: fallback::strip_tool_calls(text),
        native_calls: Vec::new(),
    };
    match LabelledFields.attempt(&response) {
        Attempt::Parsed(ParsedResponse::FinalAnswer(answer)) => Some(answer),
        _ => None,
    }
}

pub fn is_trivial_answer(text: &str) -> bool {
    let t = json::strip_code_fences(text);
    let t = t.trim();
    t.is_empty() || t == "{}" || t == "null" || t == "[]"
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

// =============================================================================
// Attempts
// =============================================================================

struct NativeCalls;

impl ParseAttempt for NativeCalls {
    fn name(&self) -> &'static str {
        "native_calls"
    }

    fn attempt(&self, response: &ModelResponse) -> Attempt {
        if response.native_calls.is_empty() {
            Attempt::Next
        } else {
            Attempt::Parsed(ParsedResponse::ToolCalls(response.native_calls.clone()))
        }
    }
}

struct TrivialGuard;

impl ParseAttempt for TrivialGuard {
    fn name(&self) -> &'static str {
        "trivial_guard"
    }

    fn attempt(&self, response: &ModelResponse) -> Attempt {
        if is_trivial_answer(&response.text) {
            Attempt::Parsed(ParsedResponse::Unparseable {
                raw: response.text.clone(),
            })
        } else {
            Attempt::Next
        }
    }
}

struct EmbeddedToolCall;

/// `args`/`arguments` may be an object or a JSON-encoded string.
fn call_args(map: &Map<String, Value>) -> Value {
    let raw = map
        .get("args")
        .or_else(|| map.get("arguments"))
        .or_else(|| map.get("parameters"));
    match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v) => v,
            Err(_) if s.trim().is_empty() => Value::Object(Map::new()),
            Err(_) => Value::String(s.clone()),
        },
        Some(v) => v.clone(),
    }
}

/// A call object: `{"tool"|"name": .., "args"|"arguments": ..}`, optionally
/// wrapped as `{"function": {...}}`. `require_args` guards bare JSON in prose
/// from matching on a lone `name` key.
fn call_from_map(map: &Map<String, Value>, require_args: bool) -> Option<ToolInvocationRequest> {
    if map.contains_key("root_cause") || map.contains_key("final_answer") {
        return None;
    }
    if let Some(Value::Object(inner)) = map.get("function") {
        return call_from_map(inner, require_args);
    }
    let name = map
        .get("tool")
        .or_else(|| map.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    let has_args = ["args", "arguments", "parameters"]
        .iter()
        .any(|k| map.contains_key(*k));
    if require_args && !has_args {
        return None;
    }
    Some(ToolInvocationRequest::new(name, call_args(map)))
}

/// Calls carried in wrapper keys: `tool_call` or `tool_calls`.
fn wrapped_calls(map: &Map<String, Value>) -> Vec<ToolInvocationRequest> {
    match (map.get("tool_call"), map.get("tool_calls")) {
        (Some(Value::Object(inner)), _) => call_from_map(inner, false).into_iter().collect(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_object())
            .filter_map(|m| call_from_map(m, false))
            .collect(),
        _ => Vec::new(),
    }
}

impl ParseAttempt for EmbeddedToolCall {
    fn name(&self) -> &'static str {
        "embedded_tool_call"
    }

    fn attempt(&self, response: &ModelResponse) -> Attempt {
        static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
        let text = response.text.as_str();

        // One call per turn in the textual convention; later markers are
        // usually the model imagining its next step.
        if let Some(marker) = cached(&MARKER, r"(?i)TOOL_CALL\s*:") {
            for m in marker.find_iter(text) {
                if let Some(map) = json::object_at(text, m.end()) {
                    if let Some(call) = call_from_map(&map, false) {
                        return Attempt::Parsed(ParsedResponse::ToolCalls(vec![call]));
                    }
                    let wrapped = wrapped_calls(&map);
                    if !wrapped.is_empty() {
                        return Attempt::Parsed(ParsedResponse::ToolCalls(wrapped));
                    }
                }
            }
        }

        for map in json::objects_in(text) {
            let wrapped = wrapped_calls(&map);
            if !wrapped.is_empty() {
                return Attempt::Parsed(ParsedResponse::ToolCalls(wrapped));
            }
            if let Some(call) = call_from_map(&map, true) {
                return Attempt::Parsed(ParsedResponse::ToolCalls(vec![call]));
            }
        }
        Attempt::Next
    }
}

struct JsonFinalAnswer;

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .filter_map(Value::as_str)
        .map(|s| json::strip_code_fences(s))
        .find(|s| !s.is_empty())
}

fn answer_from_map(map: &Map<String, Value>) -> Option<FinalAnswer> {
    let answer = FinalAnswer {
        root_cause: string_field(map, &["root_cause", "rootCause", "diagnosis"]).unwrap_or_default(),
        fix_type: string_field(map, &["fix_type"]),
        fix_description: string_field(map, &["fix_description", "fix"]).unwrap_or_default(),
        fixed_sql: string_field(map, &["fixed_sql", "fix_sql", "sql"]),
        verification_query: string_field(map, &["verification_query", "verification_sql"]),
        degraded: false,
    };
    answer.is_substantive().then_some(answer)
}

impl ParseAttempt for JsonFinalAnswer {
    fn name(&self) -> &'static str {
        "json_final_answer"
    }

    fn attempt(&self, response: &ModelResponse) -> Attempt {
        let mut candidates = json::objects_in(&response.text);
        if candidates.is_empty() {
            candidates.extend(json::whole_object(&response.text));
        }
        for map in &candidates {
            match map.get("final_answer") {
                Some(Value::Object(inner)) => {
                    if let Some(answer) = answer_from_map(inner) {
                        return Attempt::Parsed(ParsedResponse::FinalAnswer(answer));
                    }
                }
                Some(Value::String(s)) if !s.trim().is_empty() => {
                    return Attempt::Parsed(ParsedResponse::FinalAnswer(FinalAnswer {
                        root_cause: s.trim().to_string(),
                        ..Default::default()
                    }));
                }
                _ => {}
            }
            if let Some(answer) = answer_from_map(map) {
                return Attempt::Parsed(ParsedResponse::FinalAnswer(answer));
            }
        }
        // `{"answer": "..."}` only when it is the whole reply.
        if let Some(map) = json::whole_object(&response.text) {
            if let Some(s) = string_field(&map, &["answer"]) {
                return Attempt::Parsed(ParsedResponse::FinalAnswer(FinalAnswer {
                    root_cause: s,
                    ..Default::default()
                }));
            }
        }
        Attempt::Next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    RootCause,
    FixType,
    FixDescription,
    FixedSql,
    VerificationQuery,
}

fn field_for(label: &str) -> Option<Field> {
    let norm: String = label
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    match norm.as_str() {
        "rootcause" => Some(Field::RootCause),
        "fixtype" => Some(Field::FixType),
        "fixdescription" | "fix" => Some(Field::FixDescription),
        "fixedsql" | "correctedsql" | "fixsql" => Some(Field::FixedSql),
        "verificationquery" | "verificationsql" | "verifyquery" => Some(Field::VerificationQuery),
        _ => None,
    }
}

const LABELS: &str = r"root[ _-]?cause|fix[ _-]?type|fix[ _-]?description|fixed[ _-]?sql|corrected[ _-]?sql|fix[ _-]?sql|verification[ _-]?query|verification[ _-]?sql|verify[ _-]?query|fix";

/// `LABEL: rest`, tolerating list bullets, headings and bold markers.
fn label_line(line: &str) -> Option<(Field, String)> {
    static COLON: OnceLock<Option<Regex>> = OnceLock::new();
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();

    let colon = cached(
        &COLON,
        &format!(
            r"(?i)^\s*(?:#{{1,6}}\s*)?(?:[-*]\s+)?(?:\*\*|__)?\s*({LABELS})\s*(?:\*\*|__)?\s*:\s*(?:\*\*|__)?\s*(.*)$"
        ),
    );
    if let Some(caps) = colon.and_then(|re| re.captures(line)) {
        let field = field_for(caps.get(1).map_or("", |m| m.as_str()))?;
        let rest = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        return Some((field, rest));
    }

    let heading = cached(
        &HEADING,
        &format!(r"(?i)^\s*#{{1,6}}\s*(?:\*\*|__)?\s*({LABELS})\s*(?:\*\*|__)?\s*$"),
    );
    let caps = heading.and_then(|re| re.captures(line))?;
    let field = field_for(caps.get(1).map_or("", |m| m.as_str()))?;
    Some((field, String::new()))
}

/// First paragraph of a section, joined onto one line.
fn paragraph(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines() {
        let t = line.trim();
        if t.starts_with("```") {
            if out.is_empty() {
                continue;
            }
            break;
        }
        if t.is_empty() {
            if out.is_empty() {
                continue;
            }
            break;
        }
        out.push(t);
    }
    out.join(" ")
}

/// Contents of the first fenced block in `text`, if any.
fn first_fenced_block(text: &str) -> Option<String> {
    let mut inside = false;
    let mut body: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if inside {
                return Some(body.join("\n").trim().to_string());
            }
            inside = true;
            continue;
        }
        if inside {
            body.push(line);
        }
    }
    // Unterminated fence: take what followed it.
    inside.then(|| body.join("\n").trim().to_string())
}

/// SQL in a section: a fenced block when present, otherwise the raw lines up
/// to the blank line that follows a statement terminator.
fn sql_section(text: &str) -> Option<String> {
    if let Some(block) = first_fenced_block(text) {
        return (!block.is_empty()).then_some(block);
    }
    let mut out: Vec<&str> = Vec::new();
    let mut terminated = false;
    for line in text.lines() {
        let t = line.trim_end();
        if t.trim().is_empty() {
            if terminated {
                break;
            }
            if !out.is_empty() {
                out.push("");
            }
            continue;
        }
        out.push(t);
        terminated = t.ends_with(';');
    }
    let sql = out.join("\n").trim().to_string();
    (!sql.is_empty()).then_some(sql)
}

fn sections(text: &str) -> Vec<(Field, String)> {
    let mut out: Vec<(Field, String)> = Vec::new();
    for line in text.lines() {
        if let Some((field, rest)) = label_line(line) {
            out.push((field, rest));
            continue;
        }
        if let Some((_, body)) = out.last_mut() {
            body.push('\n');
            body.push_str(line);
        }
    }
    out
}

struct LabelledFields;

impl ParseAttempt for LabelledFields {
    fn name(&self) -> &'static str {
        "labelled_fields"
    }

    fn attempt(&self, response: &ModelResponse) -> Attempt {
        let found = sections(&response.text);
        if found.is_empty() {
            return Attempt::Next;
        }

        let mut answer = FinalAnswer::default();
        let mut fix_section_sql: Option<String> = None;
        for (field, body) in &found {
            match field {
                Field::RootCause if answer.root_cause.is_empty() => answer.root_cause = paragraph(body),
                Field::FixType if answer.fix_type.is_none() => {
                    let t = paragraph(body);
                    answer.fix_type = (!t.is_empty()).then_some(t);
                }
                Field::FixDescription if answer.fix_description.is_empty() => {
                    answer.fix_description = paragraph(body);
                    fix_section_sql = first_fenced_block(body).filter(|s| !s.is_empty());
                }
                Field::FixedSql if answer.fixed_sql.is_none() => answer.fixed_sql = sql_section(body),
                Field::VerificationQuery if answer.verification_query.is_none() => {
                    answer.verification_query = sql_section(body)
                }
                _ => {}
            }
        }
        if answer.fixed_sql.is_none() {
            answer.fixed_sql = fix_section_sql;
        }

        if answer.is_substantive() {
            Attempt::Parsed(ParsedResponse::FinalAnswer(answer))
        } else {
            Attempt::Next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> ModelResponse {
        ModelResponse {
            mode: ToolMode::Structured,
            text: s.to_string(),
            native_calls: Vec::new(),
        }
    }

    fn parse(s: &str) -> ParsedResponse {
        ResponseParser::new().parse(&text(s))
    }

    fn answer(s: &str) -> FinalAnswer {
        match parse(s) {
            ParsedResponse::FinalAnswer(a) => a,
            other => panic!("expected final answer, got {other:?}"),
        }
    }

    fn calls(s: &str) -> Vec<ToolInvocationRequest> {
        match parse(s) {
            ParsedResponse::ToolCalls(c) => c,
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn labelled_fields_survive_an_embedded_tool_call() {
        let raw = "ROOT_CAUSE: stg_sales has amount, not total_amount\nFIXED_SQL:\nINSERT INTO fact_sales SELECT id, amount FROM stg_sales;\n\nTOOL_CALL: {\"tool\": \"inspect_schema\", \"args\": {\"table_name\": \"stg_sales\"}}";
        let a = labelled_answer(raw).expect("labelled");
        assert_eq!(a.root_cause, "stg_sales has amount, not total_amount");
        assert_eq!(
            a.fixed_sql.as_deref(),
            Some("INSERT INTO fact_sales SELECT id, amount FROM stg_sales;")
        );
        assert_eq!(labelled_answer("TOOL_CALL: {\"tool\": \"parse_logs\", \"args\": {}}"), None);
    }

    #[test]
    fn native_calls_win() {
        let response = ModelResponse {
            mode: ToolMode::Native,
            text: "ROOT_CAUSE: something".into(),
            native_calls: vec![ToolInvocationRequest::new("read_file", json!({"file_path": "a"}))],
        };
        assert!(matches!(
            ResponseParser::new().parse(&response),
            ParsedResponse::ToolCalls(c) if c.len() == 1
        ));
    }

    #[test]
    fn trivial_replies_are_unparseable() {
        for raw in ["", "  ", "{}", "null", "[]", "```json\n{}\n```"] {
            assert!(matches!(parse(raw), ParsedResponse::Unparseable { .. }), "{raw:?}");
        }
    }

    #[test]
    fn text_tool_call_with_prose() {
        let c = calls(
            "Let me look at the destination first.\nTOOL_CALL: {\"tool\": \"inspect_schema\", \"args\": {\"table_name\": \"fact_sales\"}}\nTOOL_CALL: {\"tool\": \"inspect_schema\", \"args\": {\"table_name\": \"stg_sales\"}}",
        );
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].tool, "inspect_schema");
        assert_eq!(c[0].args["table_name"], "fact_sales");
    }

    #[test]
    fn bare_and_fenced_call_objects() {
        let c = calls("```json\n{\"name\": \"execute_sql\", \"arguments\": {\"query\": \"SELECT 1\"}}\n```");
        assert_eq!(c[0].tool, "execute_sql");

        let c = calls(r#"{"name": "sample_values", "arguments": "{\"table_name\": \"t\", \"column\": \"c\"}"}"#);
        assert_eq!(c[0].args["column"], "c");

        let c = calls(r#"{"tool_calls": [{"function": {"name": "read_file", "arguments": {"file_path": "x"}}}]}"#);
        assert_eq!(c[0].tool, "read_file");
    }

    #[test]
    fn name_without_args_is_not_a_call() {
        assert!(matches!(
            parse(r#"The table stores {"name": "Ann"} records."#),
            ParsedResponse::Unparseable { .. }
        ));
    }

    #[test]
    fn tool_call_beats_final_answer() {
        let c = calls(
            "ROOT_CAUSE: maybe a mismatch\nTOOL_CALL: {\"tool\": \"compare_schemas\", \"args\": {\"source_table\": \"a\", \"dest_table\": \"b\"}}",
        );
        assert_eq!(c[0].tool, "compare_schemas");
    }

    #[test]
    fn canonical_labelled_answer() {
        let a = answer(
            "ROOT_CAUSE: Column name mismatch: stg_sales has total_amount but fact_sales expects amount\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: Alias total_amount as amount\nFIXED_SQL:\nINSERT INTO fact_sales (id, amount)\nSELECT id, total_amount AS amount FROM stg_sales;\nVERIFICATION_QUERY:\nSELECT COUNT(*) FROM fact_sales;",
        );
        assert!(a.root_cause.starts_with("Column name mismatch"));
        assert_eq!(a.fix_type.as_deref(), Some("sql_modification"));
        assert_eq!(
            a.fixed_sql.as_deref(),
            Some("INSERT INTO fact_sales (id, amount)\nSELECT id, total_amount AS amount FROM stg_sales;")
        );
        assert_eq!(a.verification_query.as_deref(), Some("SELECT COUNT(*) FROM fact_sales;"));
        assert!(!a.degraded);
    }

    #[test]
    fn markdown_labels_and_fences() {
        let a = answer(
            "## Diagnosis\n**Root cause:** The join key formats differ: orders.customer_id is 101, customers.id is 'CUST-101'.\n\n**Fix:** strip the prefix.\n\n**Fixed SQL:**\n```sql\nINSERT INTO fact_orders SELECT o.order_id FROM orders o JOIN customers c ON o.customer_id = CAST(REPLACE(c.id, 'CUST-', '') AS INTEGER);\n```\n\nThis should work.",
        );
        assert!(a.root_cause.starts_with("The join key formats differ"));
        assert_eq!(a.fix_description, "strip the prefix.");
        assert!(a.fixed_sql.as_deref().is_some_and(|s| s.starts_with("INSERT INTO fact_orders")));
        assert!(!a.fixed_sql.as_deref().unwrap_or_default().contains("```"));
    }

    #[test]
    fn json_final_answers() {
        let a = answer(r#"{"final_answer": {"root_cause": "missing column region", "fixed_sql": "ALTER TABLE t ADD COLUMN region TEXT"}}"#);
        assert_eq!(a.root_cause, "missing column region");
        assert!(a.fixed_sql.is_some());

        let a = answer("Here you go:\n```json\n{\"root_cause\": \"type cast error on price\", \"verification_query\": \"SELECT 1\"}\n```");
        assert_eq!(a.root_cause, "type cast error on price");

        let a = answer(r#"{"answer": "the amount column is TEXT"}"#);
        assert_eq!(a.root_cause, "the amount column is TEXT");
    }

    #[test]
    fn prose_is_unparseable() {
        let raw = "I think something is wrong with the data but I need to look more.";
        assert_eq!(parse(raw), ParsedResponse::Unparseable { raw: raw.to_string() });
    }

    #[test]
    fn truncated_tool_call_falls_through() {
        assert!(matches!(
            parse("TOOL_CALL: {\"tool\": \"execute_sql\", \"args\": {\"query\": \"SELECT"),
            ParsedResponse::Unparseable { .. }
        ));
    }
}
