use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};

use etldebug_agent::config::{resolve_max_steps, DEFAULT_DIAGNOSE_MAX_STEPS};
use etldebug_agent::json::truncate_chars;
use etldebug_agent::{
    AgentConfig, BackendSettings, Confidence, DiagnosisAgent, DiagnosisStatus, SessionInput,
    SessionOutcome, StepKind, ToolModeSetting,
};
use etldebug_pipeline::{load_error_log, load_pipeline, SandboxDb};
use etldebug_tools::{apply_fix, FixOutcome, ToolContext, ToolRegistry};

/// Observation text shown per tool call in `--verbose` traces.
const TRACE_CHARS: usize = 600;

pub struct DiagnoseArgs {
    pub pipeline: PathBuf,
    pub log: Option<PathBuf>,
    pub settings: BackendSettings,
    pub max_steps: Option<usize>,
    pub auto_fix: bool,
    pub verbose: bool,
    pub tool_mode: ToolModeSetting,
}

pub fn cmd_diagnose(args: DiagnoseArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline.display()))?;
    let error_log = match &args.log {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading error log {}", path.display()))?,
        None => load_error_log(&args.pipeline)?,
    };
    let case_dir = args
        .pipeline
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let db = SandboxDb::provision(&pipeline, &case_dir)
        .with_context(|| format!("preparing the test database from {}", case_dir.display()))?;

    let backend = args.settings.build()?;
    let config = AgentConfig {
        max_steps: resolve_max_steps(args.max_steps, DEFAULT_DIAGNOSE_MAX_STEPS)?,
        max_observation_chars: crate::observation_chars()?,
        tool_mode: args.tool_mode,
        precompute: true,
    };
    let registry = ToolRegistry::standard();
    let ctx = ToolContext::new(&db, &case_dir, error_log.as_str());
    let agent = DiagnosisAgent::new(backend.as_ref(), &registry, config);

    println!(
        "{} {} with {} ({})",
        "Diagnosing".green().bold(),
        pipeline.name.bold(),
        backend.model(),
        backend.name()
    );

    let input = SessionInput {
        pipeline: &pipeline,
        error_log: &error_log,
        case_dir: Some(case_dir.as_path()),
    };
    let outcome = agent.run(&input, &ctx)?;

    if args.verbose {
        print_trace(&outcome);
    }
    print_diagnosis(&outcome);

    if args.auto_fix {
        let d = &outcome.diagnosis;
        match (d.status, &d.fixed_sql) {
            (DiagnosisStatus::Success, Some(sql)) => {
                // The session database may have been modified by tool calls.
                let scratch = SandboxDb::provision(&pipeline, &case_dir)?;
                let fix = apply_fix(&scratch, sql, d.verification_query.as_deref());
                print_fix_outcome(&fix);
            }
            (DiagnosisStatus::MaxStepsReached, Some(_)) => println!(
                "\n{} skipped; the session ran out of steps before a final answer",
                "auto-fix:".yellow().bold()
            ),
            (_, None) => println!("\n{} no fixed SQL to apply", "auto-fix:".yellow().bold()),
        }
    }
    Ok(())
}

fn print_trace(outcome: &SessionOutcome) {
    println!("\n{} ({} mode)", "Trace".bold(), outcome.tool_mode);
    if !outcome.diagnostics.is_empty() {
        println!("{}", "precomputed diagnostics:".dimmed());
        for line in outcome.diagnostics.render().lines() {
            println!("  {line}");
        }
    }
    for step in &outcome.steps {
        println!("\n{} {}", "step".cyan().bold(), step.step);
        let text = step.model_text.trim();
        if !text.is_empty() {
            for line in text.lines() {
                println!("  {line}");
            }
        }
        match &step.kind {
            StepKind::ToolCalls { calls, observations } => {
                for (call, obs) in calls.iter().zip(observations) {
                    println!("  {} {} {}", "→".cyan(), call.tool.bold(), call.args);
                    let marker = if obs.success { "ok".green() } else { "error".red() };
                    println!("  {} {marker}", "←".yellow());
                    for line in truncate_chars(&obs.payload, TRACE_CHARS).lines() {
                        println!("    {line}");
                    }
                }
            }
            StepKind::FinalAnswer => println!("  {}", "final answer".green()),
            StepKind::Salvaged => println!("  {}", "salvaged from unstructured text".yellow()),
            StepKind::Unparseable => println!("  {}", "unparseable; format reminder sent".yellow()),
        }
    }
}

fn print_diagnosis(outcome: &SessionOutcome) {
    let d = &outcome.diagnosis;
    let status = match d.status {
        DiagnosisStatus::Success => d.status.as_str().green().bold(),
        DiagnosisStatus::MaxStepsReached => d.status.as_str().yellow().bold(),
    };
    let confidence = match d.confidence {
        Confidence::High => "high".green(),
        Confidence::Degraded => "degraded".yellow(),
    };
    println!(
        "\n{} {status} | confidence {confidence} | {} steps | {:.1}s",
        "Diagnosis".bold(),
        d.steps_taken,
        outcome.elapsed.as_secs_f64()
    );
    println!("\n{}\n  {}", "Root cause:".bold(), d.root_cause);
    println!("\n{} {}", "Fix type:".bold(), d.fix_type);
    if !d.fix_description.trim().is_empty() {
        println!("\n{}\n  {}", "Fix description:".bold(), d.fix_description.trim());
    }
    if let Some(sql) = &d.fixed_sql {
        println!("\n{}", "Fixed SQL:".bold());
        for line in sql.lines() {
            println!("  {line}");
        }
    }
    if let Some(q) = &d.verification_query {
        println!("\n{}", "Verification query:".bold());
        for line in q.lines() {
            println!("  {line}");
        }
    }
    for note in &d.notes {
        println!("{} {note}", "note:".dimmed());
    }
}

fn print_fix_outcome(fix: &FixOutcome) {
    match fix {
        FixOutcome::Verified { result } => {
            println!("\n{} fix applied and verified", "auto-fix:".green().bold());
            for line in result.to_table().lines() {
                println!("  {line}");
            }
        }
        FixOutcome::Unverified { reason } => {
            println!("\n{} fix applied; {reason}", "auto-fix:".yellow().bold());
        }
        FixOutcome::Failed { error } => {
            println!("\n{} fix failed: {error}", "auto-fix:".red().bold());
        }
    }
}
