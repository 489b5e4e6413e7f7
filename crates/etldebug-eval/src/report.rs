//! Evaluation results and their table/JSON renderings.

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use etldebug_agent::{DiagnosisStatus, ToolMode};

/// One case's outcome. A case that errored out (or panicked) still has a
/// result, with both verdicts failed and `error` set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    pub case_id: String,
    pub case_name: String,
    pub root_cause_ratio: f64,
    pub root_cause_match: bool,
    pub fix_valid: bool,
    pub steps_taken: usize,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DiagnosisStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_mode: Option<ToolMode>,
    pub predicted_root_cause: String,
    pub matched_terms: Vec<String>,
    pub missing_terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_sql: Option<String>,
    pub fix_detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaseResult {
    pub fn failed(case_id: &str, case_name: &str, error: impl Into<String>, elapsed_secs: f64) -> Self {
        Self {
            case_id: case_id.to_string(),
            case_name: case_name.to_string(),
            root_cause_ratio: 0.0,
            root_cause_match: false,
            fix_valid: false,
            steps_taken: 0,
            elapsed_secs,
            status: None,
            tool_mode: None,
            predicted_root_cause: String::new(),
            matched_terms: Vec::new(),
            missing_terms: Vec::new(),
            fixed_sql: None,
            fix_detail: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalSummary {
    pub total: usize,
    pub root_cause_passed: usize,
    pub fix_passed: usize,
    pub errors: usize,
    pub diagnosis_accuracy: f64,
    pub fix_accuracy: f64,
    pub mean_steps: f64,
    pub mean_time_secs: f64,
}

impl EvalSummary {
    pub fn from_results(results: &[CaseResult]) -> Self {
        let total = results.len();
        let root_cause_passed = results.iter().filter(|r| r.root_cause_match).count();
        let fix_passed = results.iter().filter(|r| r.fix_valid).count();
        let errors = results.iter().filter(|r| r.error.is_some()).count();
        let share = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        let mean = |f: &dyn Fn(&CaseResult) -> f64| {
            if total == 0 {
                0.0
            } else {
                results.iter().map(f).sum::<f64>() / total as f64
            }
        };
        Self {
            total,
            root_cause_passed,
            fix_passed,
            errors,
            diagnosis_accuracy: share(root_cause_passed),
            fix_accuracy: share(fix_passed),
            mean_steps: mean(&|r| r.steps_taken as f64),
            mean_time_secs: mean(&|r| r.elapsed_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub model: String,
    pub backend: String,
    /// Mode the sessions ran in: `native`, `structured`, `mixed` when cases
    /// differed, or the requested setting when no session got that far.
    pub tool_mode: String,
    /// Mode that was asked for (`auto`, `native` or `structured`).
    pub tool_mode_setting: String,
    pub generated_at: DateTime<Utc>,
    pub summary: EvalSummary,
    pub results: Vec<CaseResult>,
}

impl EvalReport {
    pub fn new(model: &str, backend: &str, tool_mode_setting: &str, results: Vec<CaseResult>) -> Self {
        Self {
            model: model.to_string(),
            backend: backend.to_string(),
            tool_mode: resolved_tool_mode(tool_mode_setting, &results),
            tool_mode_setting: tool_mode_setting.to_string(),
            generated_at: Utc::now(),
            summary: EvalSummary::from_results(&results),
            results,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Fixed-width table; `verbose` adds matched/missing terms and the fix SQL.
    pub fn render_table(&self, verbose: bool) -> String {
        let id_width = self
            .results
            .iter()
            .map(|r| r.case_id.len())
            .max()
            .unwrap_or(4)
            .max(4);

        let mut out = String::new();
        out.push_str(&format!(
            "{} model {} | backend {} | tool mode {} (requested {}) | {}\n\n",
            "Eval".bold(),
            self.model,
            self.backend,
            self.tool_mode,
            self.tool_mode_setting,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!(
            "{:<id_width$}  {:<14}  {:<6}  {:>5}  {:>8}\n",
            "CASE", "ROOT CAUSE", "FIX", "STEPS", "TIME"
        ));

        for r in &self.results {
            let rc = format!("{:<14}", format!("{} ({:.2})", verdict(r.root_cause_match), r.root_cause_ratio));
            let fix = format!("{:<6}", verdict(r.fix_valid));
            out.push_str(&format!(
                "{:<id_width$}  {}  {}  {:>5}  {:>7.1}s\n",
                r.case_id,
                paint(&rc, r.root_cause_match),
                paint(&fix, r.fix_valid),
                r.steps_taken,
                r.elapsed_secs
            ));
            if let Some(err) = &r.error {
                out.push_str(&format!("    {} {err}\n", "error:".red().bold()));
            }
            if verbose {
                out.push_str(&format!("    matched: {}\n", r.matched_terms.join(", ")));
                out.push_str(&format!("    missing: {}\n", r.missing_terms.join(", ")));
                if !r.fix_detail.is_empty() {
                    out.push_str(&format!("    fix: {}\n", r.fix_detail));
                }
                if let Some(sql) = &r.fixed_sql {
                    out.push_str("    fixed sql:\n");
                    for line in sql.lines() {
                        out.push_str(&format!("      {line}\n"));
                    }
                }
            }
        }

        let s = &self.summary;
        out.push('\n');
        out.push_str(&format!(
            "Diagnosis accuracy: {}/{} ({:.1}%)\n",
            s.root_cause_passed,
            s.total,
            s.diagnosis_accuracy * 100.0
        ));
        out.push_str(&format!(
            "Fix accuracy:       {}/{} ({:.1}%)\n",
            s.fix_passed,
            s.total,
            s.fix_accuracy * 100.0
        ));
        out.push_str(&format!("Mean steps:         {:.1}\n", s.mean_steps));
        out.push_str(&format!("Mean time:          {:.1}s\n", s.mean_time_secs));
        if s.errors > 0 {
            out.push_str(&format!("{} {} case(s) errored\n", "warning:".yellow().bold(), s.errors));
        }
        out
    }
}

fn verdict(passed: bool) -> &'static str {
    if passed {
        "PASS"
    } else {
        "FAIL"
    }
}

fn paint(text: &str, passed: bool) -> String {
    if passed {
        text.green().to_string()
    } else {
        text.red().to_string()
    }
}

fn resolved_tool_mode(setting: &str, results: &[CaseResult]) -> String {
    let mut used = results.iter().filter_map(|r| r.tool_mode);
    match used.next() {
        None => setting.to_string(),
        Some(first) if used.all(|m| m == first) => first.to_string(),
        Some(_) => "mixed".to_string(),
    }
}
