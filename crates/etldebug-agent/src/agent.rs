//! The diagnosis loop.
//!
//! ```text
//! AWAITING_MODEL ──tool calls──► DISPATCHING_TOOL ──► AWAITING_MODEL
//!       │
//!       ├── final answer ─────────► TERMINATED_SUCCESS
//!       ├── unparseable, salvaged ► TERMINATED_SUCCESS (degraded)
//!       ├── unparseable ──────────► reminder, AWAITING_MODEL
//!       └── step budget spent ────► TERMINATED_EXHAUSTED
//! ```
//!
//! A step is one model call. Every tool call in a response is dispatched in
//! order within that step; identical repeated calls are allowed.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use etldebug_pipeline::PipelineConfig;
use etldebug_tools::{ToolContext, ToolInvocationRequest, ToolObservation, ToolRegistry};

use crate::backend::ChatBackend;
use crate::config::{DEFAULT_DIAGNOSE_MAX_STEPS, DEFAULT_MAX_OBSERVATION_CHARS};
use crate::conversation::Conversation;
use crate::diagnosis::Diagnosis;
use crate::fallback;
use crate::gateway::{ModelGateway, ToolMode, ToolModeSetting};
use crate::json::truncate_chars;
use crate::parser::{self, ParsedResponse, ResponseParser};
use crate::precompute::{precompute, DiagnosticsReport};
use crate::prompt;
use crate::AgentError;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model calls allowed per session; at least 1.
    pub max_steps: usize,
    /// Observation text kept in the conversation per tool call.
    pub max_observation_chars: usize,
    pub tool_mode: ToolModeSetting,
    /// Run the read-only inspections before the first model call.
    pub precompute: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_DIAGNOSE_MAX_STEPS,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
            tool_mode: ToolModeSetting::Auto,
            precompute: true,
        }
    }
}

/// What the loop is asked to diagnose.
#[derive(Debug, Clone, Copy)]
pub struct SessionInput<'a> {
    pub pipeline: &'a PipelineConfig,
    pub error_log: &'a str,
    /// Directory whose files are listed for `read_file`.
    pub case_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    ToolCalls {
        calls: Vec<ToolInvocationRequest>,
        observations: Vec<ToolObservation>,
    },
    FinalAnswer,
    /// Unstructured reply recovered by the fallback extractor.
    Salvaged,
    /// Nothing usable; a format reminder was appended.
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub model_text: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub diagnosis: Diagnosis,
    pub tool_mode: ToolMode,
    pub steps: Vec<StepRecord>,
    pub diagnostics: DiagnosticsReport,
    #[serde(skip)]
    pub conversation: Conversation,
    #[serde(skip)]
    pub elapsed: Duration,
}

pub struct DiagnosisAgent<'a> {
    backend: &'a dyn ChatBackend,
    registry: &'a ToolRegistry,
    parser: ResponseParser,
    config: AgentConfig,
}

impl<'a> DiagnosisAgent<'a> {
    pub fn new(backend: &'a dyn ChatBackend, registry: &'a ToolRegistry, config: AgentConfig) -> Self {
        Self {
            backend,
            registry,
            parser: ResponseParser::new(),
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs one session to termination. Only a backend failure is an error;
    /// every other path ends in a [`Diagnosis`].
    pub fn run(&self, input: &SessionInput<'_>, ctx: &ToolContext) -> Result<SessionOutcome, AgentError> {
        let started = Instant::now();
        let max_steps = self.config.max_steps.max(1);
        let gateway = ModelGateway::connect(self.backend, self.registry.catalogue(), self.config.tool_mode)?;

        let diagnostics = if self.config.precompute {
            precompute(input.pipeline, ctx)
        } else {
            DiagnosticsReport::default()
        };
        let rendered = diagnostics.render();

        let mut conversation = Conversation::new();
        conversation.push_system(prompt::SYSTEM_PROMPT);
        conversation.push_user(prompt::build_user_prompt(
            input.pipeline,
            input.error_log,
            input.case_dir,
            Some(&rendered),
        ));

        let mut steps: Vec<StepRecord> = Vec::new();
        let mut last_observation: Option<ToolObservation> = None;

        for step in 1..=max_steps {
            let response = gateway.complete(&conversation)?;
            debug!(step, chars = response.text.len(), calls = response.native_calls.len(), "model replied");

            match self.parser.parse(&response) {
                ParsedResponse::ToolCalls(mut calls) => {
                    if response.mode == ToolMode::Native {
                        for (i, call) in calls.iter_mut().enumerate() {
                            if call.call_id.is_none() {
                                call.call_id = Some(format!("call_{step}_{i}"));
                            }
                        }
                    }
                    conversation.push_assistant(response.text.clone(), calls.clone());

                    let mut observations = Vec::with_capacity(calls.len());
                    for call in &calls {
                        let obs = self.registry.dispatch(call, ctx);
                        info!(step, tool = %call.tool, success = obs.success, "tool dispatched");
                        conversation.push_tool(
                            &call.tool,
                            call.call_id.clone(),
                            truncate_chars(&obs.payload, self.config.max_observation_chars),
                        );
                        last_observation = Some(obs.clone());
                        observations.push(obs);
                    }
                    steps.push(StepRecord {
                        step,
                        model_text: response.text,
                        kind: StepKind::ToolCalls {
                            calls,
                            observations,
                        },
                    });
                }
                ParsedResponse::FinalAnswer(answer) => {
                    conversation.push_assistant(response.text.clone(), Vec::new());
                    let diagnosis = Diagnosis::from_answer(answer, &response.text, step);
                    info!(step, "final answer");
                    steps.push(StepRecord {
                        step,
                        model_text: response.text,
                        kind: StepKind::FinalAnswer,
                    });
                    return Ok(SessionOutcome {
                        diagnosis,
                        tool_mode: gateway.mode(),
                        steps,
                        diagnostics,
                        conversation,
                        elapsed: started.elapsed(),
                    });
                }
                ParsedResponse::Unparseable { raw } => {
                    conversation.push_assistant(raw.clone(), Vec::new());
                    if let Some(answer) = fallback::salvage(&raw).filter(fallback::is_conclusive) {
                        warn!(step, "unstructured reply; using salvaged diagnosis");
                        let mut diagnosis = Diagnosis::from_answer(answer, &raw, step);
                        diagnosis
                            .notes
                            .push("recovered from an unstructured reply".to_string());
                        steps.push(StepRecord {
                            step,
                            model_text: raw,
                            kind: StepKind::Salvaged,
                        });
                        return Ok(SessionOutcome {
                            diagnosis,
                            tool_mode: gateway.mode(),
                            steps,
                            diagnostics,
                            conversation,
                            elapsed: started.elapsed(),
                        });
                    }
                    debug!(step, "unparseable reply; sending format reminder");
                    conversation.push_user(prompt::FORMAT_REMINDER);
                    steps.push(StepRecord {
                        step,
                        model_text: raw,
                        kind: StepKind::Unparseable,
                    });
                }
            }
        }

        warn!(max_steps, "step budget exhausted without a final answer");
        let raw = conversation
            .last_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let summary = fallback::strip_tool_calls(&raw);
        let salvaged = parser::labelled_answer(&raw).or_else(|| fallback::salvage(&raw));
        let mut diagnosis = Diagnosis::exhausted(salvaged, summary.trim(), &raw, max_steps);
        if let Some(obs) = &last_observation {
            let head: String = obs.payload.chars().take(200).collect();
            diagnosis
                .notes
                .push(format!("last observation ({}): {head}", obs.tool));
        }

        Ok(SessionOutcome {
            diagnosis,
            tool_mode: gateway.mode(),
            steps,
            diagnostics,
            conversation,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatReply, ScriptedBackend};
    use crate::conversation::Role;
    use crate::diagnosis::{Confidence, DiagnosisStatus};
    use etldebug_pipeline::{load_pipeline, SandboxDb};
    use serde_json::json;
    use std::fs;

    struct Session {
        case: tempfile::TempDir,
        db: SandboxDb,
        pipeline: PipelineConfig,
    }

    fn session() -> Session {
        let case = tempfile::tempdir().expect("tempdir");
        let dir = case.path();
        fs::write(
            dir.join("pipeline.yaml"),
            "name: sales\nsource:\n  type: csv\n  path: stg_sales.csv\ndestination:\n  engine: sqlite\n  table: fact_sales\ntransform:\n  sql: INSERT INTO fact_sales (id, amount) SELECT id, total_amount FROM stg_sales\n",
        )
        .expect("pipeline");
        fs::write(dir.join("stg_sales.csv"), "id,amount\n1,10\n2,20\n").expect("csv");
        fs::write(dir.join("schema.sql"), "CREATE TABLE fact_sales (id INTEGER, amount REAL);")
            .expect("schema");
        let pipeline = load_pipeline(dir.join("pipeline.yaml")).expect("load");
        let db = SandboxDb::provision(&pipeline, dir).expect("provision");
        Session { case, db, pipeline }
    }

    fn run(s: &Session, backend: &dyn ChatBackend, max_steps: usize) -> SessionOutcome {
        let registry = ToolRegistry::standard();
        let ctx = ToolContext::new(&s.db, s.case.path(), "ERROR no such column: total_amount");
        let agent = DiagnosisAgent::new(
            backend,
            &registry,
            AgentConfig {
                max_steps,
                ..Default::default()
            },
        );
        let input = SessionInput {
            pipeline: &s.pipeline,
            error_log: "ERROR no such column: total_amount",
            case_dir: Some(s.case.path()),
        };
        agent.run(&input, &ctx).expect("session")
    }

    const ANSWER: &str = "ROOT_CAUSE: Column name mismatch: transform selects total_amount but stg_sales has amount\nFIX_TYPE: sql_modification\nFIX_DESCRIPTION: use amount\nFIXED_SQL:\nINSERT INTO fact_sales (id, amount) SELECT id, amount FROM stg_sales;\nVERIFICATION_QUERY:\nSELECT COUNT(*) FROM fact_sales;";

    #[test]
    fn tool_then_answer() {
        let s = session();
        let backend = ScriptedBackend::from_texts([
            "TOOL_CALL: {\"tool\": \"inspect_schema\", \"args\": {\"table_name\": \"stg_sales\"}}",
            ANSWER,
        ]);
        let out = run(&s, &backend, 10);

        assert_eq!(out.tool_mode, ToolMode::Structured);
        assert_eq!(out.diagnosis.status, DiagnosisStatus::Success);
        assert_eq!(out.diagnosis.confidence, Confidence::High);
        assert_eq!(out.diagnosis.steps_taken, 2);
        assert!(out.diagnosis.root_cause.starts_with("Column name mismatch"));
        assert_eq!(out.steps.len(), 2);
        match &out.steps[0].kind {
            StepKind::ToolCalls { observations, .. } => {
                assert!(observations[0].success);
                assert!(observations[0].payload.starts_with("Table: stg_sales"));
            }
            other => panic!("unexpected step {other:?}"),
        }

        let roles: Vec<Role> = out.conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert!(out.conversation.messages()[1].content.contains("## Precomputed Diagnostics"));
    }

    #[test]
    fn native_calls_get_ids_and_all_dispatch() {
        let s = session();
        let backend = ScriptedBackend::new(vec![
            ChatReply {
                content: String::new(),
                tool_calls: vec![
                    ToolInvocationRequest::new("inspect_schema", json!({"table_name": "fact_sales"})),
                    ToolInvocationRequest::new("inspect_schema", json!({"table_name": "stg_sales"})),
                ],
            },
            ChatReply::text(ANSWER),
        ])
        .with_native_tools(true);
        let out = run(&s, &backend, 10);

        assert_eq!(out.tool_mode, ToolMode::Native);
        let tools: Vec<_> = out
            .conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_1_0"));
        assert_eq!(tools[1].tool_call_id.as_deref(), Some("call_1_1"));
        assert_eq!(out.diagnosis.steps_taken, 2);
    }

    #[test]
    fn reminder_then_recovery() {
        let s = session();
        let backend = ScriptedBackend::from_texts(["{}", ANSWER]);
        let out = run(&s, &backend, 5);
        assert_eq!(out.steps[0].kind, StepKind::Unparseable);
        assert!(out
            .conversation
            .messages()
            .iter()
            .any(|m| m.role == Role::User && m.content == prompt::FORMAT_REMINDER));
        assert_eq!(out.diagnosis.status, DiagnosisStatus::Success);
    }

    #[test]
    fn prose_with_sql_is_salvaged() {
        let s = session();
        let backend = ScriptedBackend::from_texts([
            "The problem is a column mismatch between stg_sales and the transform.\n\n```sql\nINSERT INTO fact_sales (id, amount) SELECT id, amount FROM stg_sales;\n```",
        ]);
        let out = run(&s, &backend, 5);
        assert_eq!(out.steps[0].kind, StepKind::Salvaged);
        assert_eq!(out.diagnosis.confidence, Confidence::Degraded);
        assert_eq!(out.diagnosis.status, DiagnosisStatus::Success);
        assert!(out.diagnosis.fixed_sql.is_some());
    }

    #[test]
    fn planning_prose_gets_a_reminder_not_a_verdict() {
        let s = session();
        let backend = ScriptedBackend::from_texts([
            "I should first check whether the total_amount column is missing from stg_sales.",
            ANSWER,
        ]);
        let out = run(&s, &backend, 5);
        assert_eq!(out.steps[0].kind, StepKind::Unparseable);
        assert_eq!(out.steps[1].kind, StepKind::FinalAnswer);
        assert_eq!(out.diagnosis.steps_taken, 2);
        assert_eq!(out.diagnosis.confidence, Confidence::High);
        assert_eq!(
            out.diagnosis.fixed_sql.as_deref(),
            Some("INSERT INTO fact_sales (id, amount) SELECT id, amount FROM stg_sales;")
        );
    }

    #[test]
    fn exhaustion_keeps_labelled_fields_next_to_a_tool_call() {
        let s = session();
        let backend = ScriptedBackend::from_texts([
            "ROOT_CAUSE: stg_sales has amount, not total_amount\nFIXED_SQL:\nINSERT INTO fact_sales (id, amount) SELECT id, amount FROM stg_sales;\n\nTOOL_CALL: {\"tool\": \"inspect_schema\", \"args\": {\"table_name\": \"fact_sales\"}}",
        ]);
        let out = run(&s, &backend, 1);
        assert_eq!(out.diagnosis.status, DiagnosisStatus::MaxStepsReached);
        assert_eq!(out.diagnosis.root_cause, "stg_sales has amount, not total_amount");
        assert_eq!(
            out.diagnosis.fixed_sql.as_deref(),
            Some("INSERT INTO fact_sales (id, amount) SELECT id, amount FROM stg_sales;")
        );
    }

    #[test]
    fn exhaustion_synthesizes_a_diagnosis() {
        let s = session();
        let backend = ScriptedBackend::from_texts([
            "TOOL_CALL: {\"tool\": \"execute_sql\", \"args\": {\"query\": \"SELECT * FROM stg_sales\"}}",
        ]);
        let out = run(&s, &backend, 1);
        assert_eq!(out.diagnosis.status, DiagnosisStatus::MaxStepsReached);
        assert!(!out.diagnosis.root_cause.is_empty());
        assert_eq!(out.diagnosis.steps_taken, 1);
        assert!(out.diagnosis.notes.iter().any(|n| n.starts_with("last observation (execute_sql)")));
    }
}
