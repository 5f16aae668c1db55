use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

mod commands;
mod config;
mod report;

use commands::ContextArgs;
use config::RunwayConfig;

#[derive(Parser, Debug)]
#[command(name = "runway")]
#[command(about = "Dependency-aware deployment orchestrator", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "runway.toml", env = "RUNWAY_CONFIG")]
    config: PathBuf,

    /// Data directory for execution state and event logs
    #[arg(short, long, global = true, default_value = ".runway", env = "RUNWAY_DATA_DIR")]
    data_dir: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a manifest and print the step graph without running anything
    Plan {
        manifest: PathBuf,

        #[command(flatten)]
        context: ContextArgs,

        /// Print the compiled plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute every unfinished step, then verify deployment health
    Apply {
        manifest: PathBuf,

        #[command(flatten)]
        context: ContextArgs,

        /// Maximum steps running at once (overrides the config file)
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Show execution records of a plan, or list known plans
    Status {
        /// Plan identity (full hash or unique prefix)
        plan_id: Option<String>,
    },

    /// Reverse succeeded steps in reverse dependency order
    Rollback {
        manifest: PathBuf,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Delete all stored execution records of a plan
    Purge { plan_id: String },

    /// Print the event log of a run
    Events { run_id: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "runway=info".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel the token on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing running steps and skipping the rest");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(args: Args) -> Result<u8> {
    let mut config = RunwayConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::Plan {
            manifest,
            context,
            json,
        } => commands::plan(&config, &manifest, context, json),
        Command::Apply {
            manifest,
            context,
            max_concurrency,
        } => {
            if let Some(max) = max_concurrency {
                config.executor.max_concurrency = max;
            }
            commands::apply(&config, &manifest, context, cancel_on_interrupt()).await
        }
        Command::Status { plan_id } => commands::status(&config, plan_id.as_deref()),
        Command::Rollback { manifest, context } => {
            commands::rollback(&config, &manifest, context, cancel_on_interrupt()).await
        }
        Command::Purge { plan_id } => commands::purge(&config, &plan_id),
        Command::Events { run_id } => commands::events(&config, &run_id).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(commands::exit_code_for(&e))
        }
    }
}
