//! etl-debug CLI
//!
//! - `diagnose`: run the diagnosis loop on one pipeline
//! - `eval`: run the loop over the golden set and score every case
//! - `list-tools`: print the tool catalogue

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use etldebug_agent::{BackendSettings, ToolModeSetting};
use etldebug_tools::ToolRegistry;

mod diagnose;
mod eval;

#[derive(Parser)]
#[command(name = "etl-debug")]
#[command(author, version, about = "Diagnose and fix failing ETL pipeline SQL with a language model")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,
    /// Log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short = 'v', long = "log-verbose", action = ArgAction::Count, global = true)]
    log_verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

/// Model backend selection, shared by every subcommand.
#[derive(Args, Debug, Clone)]
struct BackendArgs {
    /// ollama | openai | scripted (env: ETLDEBUG_BACKEND)
    #[arg(long, global = true)]
    backend: Option<String>,
    /// Ollama base URL (env: OLLAMA_HOST)
    #[arg(long, global = true)]
    ollama_host: Option<String>,
    /// OpenAI-compatible base URL (env: OPENAI_BASE_URL)
    #[arg(long, global = true)]
    openai_base_url: Option<String>,
    /// Replies for the scripted backend (YAML or JSON list)
    #[arg(long, global = true)]
    script: Option<PathBuf>,
    /// Per-request timeout in seconds; 0 disables (env: ETLDEBUG_LLM_TIMEOUT_SECS)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

impl BackendArgs {
    fn settings(&self, model: Option<String>) -> BackendSettings {
        BackendSettings {
            kind: self.backend.clone(),
            model,
            ollama_host: self.ollama_host.clone(),
            openai_base_url: self.openai_base_url.clone(),
            timeout_secs: self.timeout_secs,
            script: self.script.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose one failing pipeline.
    Diagnose {
        /// Pipeline definition (pipeline.yaml); its directory holds the data files
        #[arg(long)]
        pipeline: PathBuf,
        /// Error log (defaults to error.log next to the pipeline)
        #[arg(long)]
        log: Option<PathBuf>,
        /// Model name (env: ETLDEBUG_MODEL)
        #[arg(long)]
        model: Option<String>,
        /// Step ceiling (env: ETLDEBUG_MAX_STEPS)
        #[arg(long)]
        max_steps: Option<usize>,
        /// Apply the proposed fix to the scratch database and run its verification query
        #[arg(long)]
        auto_fix: bool,
        /// Print every step: model text, tool calls and observations
        #[arg(long)]
        verbose: bool,
        #[arg(long, value_enum, default_value_t = ToolModeArg::Auto)]
        tool_mode: ToolModeArg,
    },

    /// Evaluate against the golden set.
    Eval {
        #[arg(long, default_value = "golden_set")]
        golden_dir: PathBuf,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
        #[arg(long, value_enum, default_value_t = ToolModeArg::Auto)]
        tool_mode: ToolModeArg,
        /// Show matched/missing keywords and the proposed SQL per case
        #[arg(long)]
        verbose_scoring: bool,
        /// Only cases whose id starts with this prefix
        #[arg(long = "case")]
        case: Option<String>,
        #[arg(long)]
        max_steps: Option<usize>,
        /// Cases evaluated in parallel
        #[arg(long, default_value_t = 1)]
        jobs: usize,
    },

    /// List the tools the model can call.
    ListTools,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ToolModeArg {
    Auto,
    Native,
    Structured,
}

impl From<ToolModeArg> for ToolModeSetting {
    fn from(arg: ToolModeArg) -> Self {
        match arg {
            ToolModeArg::Auto => ToolModeSetting::Auto,
            ToolModeArg::Native => ToolModeSetting::Native,
            ToolModeArg::Structured => ToolModeSetting::Structured,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests, embedding) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_verbose);

    if let Err(err) = run(cli) {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Diagnose {
            pipeline,
            log,
            model,
            max_steps,
            auto_fix,
            verbose,
            tool_mode,
        } => diagnose::cmd_diagnose(diagnose::DiagnoseArgs {
            pipeline,
            log,
            settings: cli.backend.settings(model),
            max_steps,
            auto_fix,
            verbose,
            tool_mode: tool_mode.into(),
        }),
        Commands::Eval {
            golden_dir,
            model,
            output,
            tool_mode,
            verbose_scoring,
            case,
            max_steps,
            jobs,
        } => {
            if jobs == 0 {
                return Err(anyhow!("--jobs must be at least 1"));
            }
            eval::cmd_eval(eval::EvalArgs {
                golden_dir,
                settings: cli.backend.settings(model),
                json: output == OutputFormat::Json,
                tool_mode: tool_mode.into(),
                verbose_scoring,
                case,
                max_steps,
                jobs,
            })
        }
        Commands::ListTools => cmd_list_tools(),
    }
}

fn cmd_list_tools() -> Result<()> {
    let registry = ToolRegistry::standard();
    println!("{}", "Available tools".bold());
    print!("{}", registry.catalogue().describe());
    Ok(())
}

/// Shared by both subcommands: observation cap from the environment.
fn observation_chars() -> Result<usize> {
    etldebug_agent::config::max_observation_chars().context("reading the observation limit")
}
