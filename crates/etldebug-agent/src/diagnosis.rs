use serde::{Deserialize, Serialize};

use crate::parser::FinalAnswer;

pub const DEFAULT_FIX_TYPE: &str = "sql_modification";

const EXHAUSTED_NOTICE: &str = "Agent reached maximum steps without providing a diagnosis.";
const UNSTATED_ROOT_CAUSE: &str = "Root cause not stated; see the proposed fix.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStatus {
    Success,
    MaxStepsReached,
}

impl DiagnosisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisStatus::Success => "success",
            DiagnosisStatus::MaxStepsReached => "max_steps_reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Degraded,
}

/// The terminal product of a session. `root_cause` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub status: DiagnosisStatus,
    pub confidence: Confidence,
    pub root_cause: String,
    pub fix_type: String,
    pub fix_description: String,
    pub fixed_sql: Option<String>,
    pub verification_query: Option<String>,
    pub raw_response: String,
    pub steps_taken: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

fn non_empty_root_cause(answer: &FinalAnswer) -> String {
    let rc = answer.root_cause.trim();
    if !rc.is_empty() {
        return rc.to_string();
    }
    let desc = answer.fix_description.trim();
    if !desc.is_empty() {
        return desc.to_string();
    }
    UNSTATED_ROOT_CAUSE.to_string()
}

impl Diagnosis {
    /// A loop that ended on an answer.
    pub fn from_answer(answer: FinalAnswer, raw_response: &str, steps_taken: usize) -> Self {
        let confidence = if answer.degraded {
            Confidence::Degraded
        } else {
            Confidence::High
        };
        Self::build(DiagnosisStatus::Success, confidence, answer, raw_response, steps_taken)
    }

    /// A loop that ran out of steps. Uses whatever was salvaged, else the head
    /// of `last_text`, else a fixed notice.
    pub fn exhausted(
        salvaged: Option<FinalAnswer>,
        last_text: &str,
        raw_response: &str,
        steps_taken: usize,
    ) -> Self {
        let answer = salvaged.unwrap_or_else(|| {
            let head: String = last_text.trim().chars().take(200).collect();
            FinalAnswer {
                root_cause: if head.is_empty() {
                    EXHAUSTED_NOTICE.to_string()
                } else {
                    head
                },
                ..Default::default()
            }
        });
        let mut d = Self::build(
            DiagnosisStatus::MaxStepsReached,
            Confidence::Degraded,
            answer,
            raw_response,
            steps_taken,
        );
        d.notes.push(format!("auto-finalized: step budget of {steps_taken} exhausted"));
        d
    }

    fn build(
        status: DiagnosisStatus,
        confidence: Confidence,
        answer: FinalAnswer,
        raw_response: &str,
        steps_taken: usize,
    ) -> Self {
        let root_cause = non_empty_root_cause(&answer);
        Self {
            status,
            confidence,
            root_cause,
            fix_type: answer
                .fix_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FIX_TYPE.to_string()),
            fix_description: answer.fix_description,
            fixed_sql: answer.fixed_sql.filter(|s| !s.trim().is_empty()),
            verification_query: answer.verification_query.filter(|s| !s.trim().is_empty()),
            raw_response: raw_response.to_string(),
            steps_taken,
            notes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_gaps() {
        let d = Diagnosis::from_answer(
            FinalAnswer {
                fixed_sql: Some("UPDATE t SET x = 1".into()),
                verification_query: Some("  ".into()),
                ..Default::default()
            },
            "raw",
            3,
        );
        assert_eq!(d.status, DiagnosisStatus::Success);
        assert_eq!(d.confidence, Confidence::High);
        assert_eq!(d.root_cause, UNSTATED_ROOT_CAUSE);
        assert_eq!(d.fix_type, DEFAULT_FIX_TYPE);
        assert_eq!(d.verification_query, None);
    }

    #[test]
    fn exhaustion_never_leaves_root_cause_empty() {
        let d = Diagnosis::exhausted(None, "", "", 1);
        assert_eq!(d.status, DiagnosisStatus::MaxStepsReached);
        assert_eq!(d.confidence, Confidence::Degraded);
        assert_eq!(d.root_cause, EXHAUSTED_NOTICE);
        assert_eq!(d.notes.len(), 1);

        let long = "x".repeat(500);
        let d = Diagnosis::exhausted(None, &long, &long, 4);
        assert_eq!(d.root_cause.len(), 200);
    }

    #[test]
    fn status_serializes_snake_case() {
        let v = serde_json::to_value(DiagnosisStatus::MaxStepsReached).expect("json");
        assert_eq!(v, "max_steps_reached");
    }
}
