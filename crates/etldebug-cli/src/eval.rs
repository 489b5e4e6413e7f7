use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use etldebug_agent::config::{resolve_max_steps, DEFAULT_EVAL_MAX_STEPS};
use etldebug_agent::{AgentConfig, BackendSettings, ToolModeSetting};
use etldebug_eval::{EvalOptions, EvalRunner};

pub struct EvalArgs {
    pub golden_dir: PathBuf,
    pub settings: BackendSettings,
    pub json: bool,
    pub tool_mode: ToolModeSetting,
    pub verbose_scoring: bool,
    pub case: Option<String>,
    pub max_steps: Option<usize>,
    pub jobs: usize,
}

pub fn cmd_eval(args: EvalArgs) -> Result<()> {
    let backend = args.settings.build()?;
    let options = EvalOptions {
        agent: AgentConfig {
            max_steps: resolve_max_steps(args.max_steps, DEFAULT_EVAL_MAX_STEPS)?,
            max_observation_chars: crate::observation_chars()?,
            tool_mode: args.tool_mode,
            precompute: true,
        },
        case_prefix: args.case,
        jobs: args.jobs,
    };

    let runner = EvalRunner::from_dir(backend.as_ref(), &args.golden_dir, options)
        .with_context(|| format!("loading golden set {}", args.golden_dir.display()))?;
    if !args.json {
        eprintln!(
            "{} {} with {} ({})",
            "Evaluating".green().bold(),
            runner.golden().root.display(),
            backend.model(),
            backend.name()
        );
    }
    let report = runner.run()?;

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_table(args.verbose_scoring));
    }
    Ok(())
}
