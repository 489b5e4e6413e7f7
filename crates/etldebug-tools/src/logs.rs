use regex::RegexBuilder;

use crate::catalogue::{ParamKind, ParamSpec, ToolSpec};
use crate::registry::{Tool, ToolArgs, ToolContext};
use crate::ToolError;

const MAX_LOG_LINES: usize = 20;
const DEFAULT_LEVELS: [&str; 3] = ["ERROR", "WARN", "FATAL"];

/// Filter log text by a case-insensitive regex, or by severity when no
/// pattern is given. At most 20 lines are returned, followed by a count of
/// the lines left out.
pub fn filter_log_lines(content: &str, pattern: Option<&str>) -> Result<String, ToolError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok("No log content provided.".to_string());
    }
    let lines = content.lines();

    let matches: Vec<&str> = match pattern.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => {
            let re = RegexBuilder::new(p).case_insensitive(true).build()?;
            lines.filter(|l| re.is_match(l)).collect()
        }
        None => lines
            .filter(|l| DEFAULT_LEVELS.iter().any(|lvl| l.contains(lvl)))
            .collect(),
    };

    if matches.is_empty() {
        return Ok("No matching log lines found.".to_string());
    }
    let mut out = matches
        .iter()
        .take(MAX_LOG_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    if matches.len() > MAX_LOG_LINES {
        out.push_str(&format!("\n... ({} more lines)", matches.len() - MAX_LOG_LINES));
    }
    Ok(out)
}

pub struct ParseLogs {
    spec: ToolSpec,
}

impl ParseLogs {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec {
                name: "parse_logs".to_string(),
                description: "Search the pipeline's error log. With no pattern, returns ERROR/WARN/FATAL lines.".to_string(),
                parameters: vec![
                    ParamSpec::optional("pattern", ParamKind::String, "Case-insensitive regex to filter lines"),
                    ParamSpec::optional("log_content", ParamKind::String, "Log text to search; defaults to the pipeline's error log"),
                ],
            },
        }
    }
}

impl Tool for ParseLogs {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(&self, args: &ToolArgs<'_>, ctx: &ToolContext) -> Result<String, ToolError> {
        let content = args
            .str("log_content")
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(ctx.error_log.as_str());
        filter_log_lines(content, args.str("pattern"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LOG: &str = "2024-01-15 02:00:01 INFO Starting pipeline\n\
                       2024-01-15 02:00:02 WARN slow source\n\
                       2024-01-15 02:00:03 ERROR table stg_sales has no column named total_amount\n\
                       2024-01-15 02:00:04 INFO done";

    #[test]
    fn default_filter_keeps_severity_lines() {
        let out = filter_log_lines(LOG, None).expect("filter");
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("WARN slow source"));
        assert!(out.contains("total_amount"));
    }

    #[test]
    fn pattern_is_case_insensitive() {
        let out = filter_log_lines(LOG, Some("STARTING")).expect("filter");
        assert_eq!(out, "2024-01-15 02:00:01 INFO Starting pipeline");
    }

    #[test]
    fn empty_and_unmatched_inputs() {
        assert_eq!(filter_log_lines("  \n", None).expect("empty"), "No log content provided.");
        assert_eq!(
            filter_log_lines(LOG, Some("duckdb")).expect("none"),
            "No matching log lines found."
        );
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let err = filter_log_lines(LOG, Some("(unclosed")).unwrap_err();
        assert!(err.to_string().starts_with("invalid regex pattern"));
    }

    #[test]
    fn caps_output_at_twenty_lines() {
        let log: String = (0..25).map(|i| format!("ERROR line {i}\n")).collect();
        let out = filter_log_lines(&log, None).expect("filter");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 21);
        assert_eq!(lines[20], "... (5 more lines)");
    }

    proptest! {
        #[test]
        fn arbitrary_patterns_never_panic(pattern in ".{0,12}") {
            let _ = filter_log_lines(LOG, Some(&pattern));
        }
    }
}
