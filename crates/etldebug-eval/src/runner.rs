//! Drives the diagnosis loop over golden-set cases.
//!
//! Every case gets its own pristine sandbox: the session works on one fork,
//! the scorer on another. A case that fails to load, errors or panics is
//! recorded as a failed [`CaseResult`]; it never stops the run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use etldebug_agent::config::DEFAULT_EVAL_MAX_STEPS;
use etldebug_agent::{AgentConfig, ChatBackend, DiagnosisAgent, GatewayError, SessionInput};
use etldebug_pipeline::{CaseManifestEntry, EvalCase, GoldenSet, PipelineError, SandboxDb};
use etldebug_tools::{ToolContext, ToolRegistry};

use crate::report::{CaseResult, EvalReport};
use crate::scorer::{score_fix, score_root_cause};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("model backend is not usable: {0}")]
    Backend(#[from] GatewayError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("no golden-set case id starts with `{0}`")]
    NoCases(String),
    #[error("could not start {jobs} worker threads: {message}")]
    ThreadPool { jobs: usize, message: String },
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub agent: AgentConfig,
    /// Only cases whose id starts with this prefix.
    pub case_prefix: Option<String>,
    /// Cases evaluated concurrently; 1 runs them in order on this thread.
    pub jobs: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                max_steps: DEFAULT_EVAL_MAX_STEPS,
                ..AgentConfig::default()
            },
            case_prefix: None,
            jobs: 1,
        }
    }
}

pub struct EvalRunner<'a> {
    backend: &'a dyn ChatBackend,
    registry: ToolRegistry,
    golden: GoldenSet,
    options: EvalOptions,
}

impl<'a> EvalRunner<'a> {
    pub fn new(backend: &'a dyn ChatBackend, golden: GoldenSet, options: EvalOptions) -> Self {
        Self {
            backend,
            registry: ToolRegistry::standard(),
            golden,
            options,
        }
    }

    pub fn from_dir(
        backend: &'a dyn ChatBackend,
        golden_dir: impl AsRef<Path>,
        options: EvalOptions,
    ) -> Result<Self, EvalError> {
        Ok(Self::new(backend, GoldenSet::load(golden_dir)?, options))
    }

    pub fn golden(&self) -> &GoldenSet {
        &self.golden
    }

    /// Runs every selected case. The backend is pinged first so an unreachable
    /// model aborts the run instead of failing every case.
    pub fn run(&self) -> Result<EvalReport, EvalError> {
        self.backend.ping()?;

        let cases = self.golden.select(self.options.case_prefix.as_deref());
        if cases.is_empty() {
            return Err(EvalError::NoCases(
                self.options.case_prefix.clone().unwrap_or_default(),
            ));
        }
        info!(cases = cases.len(), jobs = self.options.jobs, "starting evaluation");

        let results: Vec<CaseResult> = if self.options.jobs > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.jobs)
                .build()
                .map_err(|e| EvalError::ThreadPool {
                    jobs: self.options.jobs,
                    message: e.to_string(),
                })?;
            // `collect` on an indexed parallel iterator keeps manifest order.
            pool.install(|| cases.par_iter().map(|entry| self.run_case(entry)).collect())
        } else {
            cases.iter().map(|entry| self.run_case(entry)).collect()
        };

        Ok(EvalReport::new(
            self.backend.model(),
            self.backend.name(),
            self.options.agent.tool_mode.as_str(),
            results,
        ))
    }

    /// One case, isolated: errors and panics both become a failed result.
    pub fn run_case(&self, entry: &CaseManifestEntry) -> CaseResult {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.evaluate(entry, started)));
        let elapsed = started.elapsed().as_secs_f64();
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(message)) => CaseResult::failed(&entry.id, &entry.name, message, elapsed),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                CaseResult::failed(&entry.id, &entry.name, format!("panicked: {message}"), elapsed)
            }
        };

        match &result.error {
            None => info!(
                case = %entry.id,
                root_cause = result.root_cause_match,
                fix = result.fix_valid,
                steps = result.steps_taken,
                "case scored"
            ),
            Some(e) => warn!(case = %entry.id, error = %e, "case failed"),
        }
        result
    }

    fn evaluate(&self, entry: &CaseManifestEntry, started: Instant) -> Result<CaseResult, String> {
        let case = EvalCase::load(&self.golden, entry).map_err(|e| e.to_string())?;
        let pristine = SandboxDb::provision(&case.pipeline, &case.dir).map_err(|e| e.to_string())?;
        let session_db = pristine.fork().map_err(|e| e.to_string())?;

        let ctx = ToolContext::new(&session_db, &case.dir, case.error_log.as_str());
        let agent = DiagnosisAgent::new(self.backend, &self.registry, self.options.agent.clone());
        let input = SessionInput {
            pipeline: &case.pipeline,
            error_log: &case.error_log,
            case_dir: Some(case.dir.as_path()),
        };
        let outcome = agent.run(&input, &ctx).map_err(|e| e.to_string())?;
        let elapsed_secs = started.elapsed().as_secs_f64();

        let diagnosis = &outcome.diagnosis;
        let rc = score_root_cause(&diagnosis.root_cause, &case.expected.root_cause);
        let fix = score_fix(&pristine, diagnosis, &case.expected);

        Ok(CaseResult {
            case_id: case.id,
            case_name: case.name,
            root_cause_ratio: rc.ratio,
            root_cause_match: rc.passed,
            fix_valid: fix.passed,
            steps_taken: diagnosis.steps_taken,
            elapsed_secs,
            status: Some(diagnosis.status),
            tool_mode: Some(outcome.tool_mode),
            predicted_root_cause: diagnosis.root_cause.clone(),
            matched_terms: rc.matched,
            missing_terms: rc.missing,
            fixed_sql: diagnosis.fixed_sql.clone(),
            fix_detail: fix.detail,
            error: None,
        })
    }
}
