use anyhow::{Context, Result};
use auto_sdd::config::LOG_DIR;
use auto_sdd::errors::exit_code_for;
use auto_sdd::settings::BranchStrategy;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

#[derive(Parser)]
#[command(name = "auto-sdd")]
#[command(version, about = "Spec-driven feature build loop for AI coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build pending roadmap features one at a time
    Build {
        /// Continue from the last checkpoint
        #[arg(long)]
        resume: bool,

        /// Branch strategy: chained, independent, sequential, both
        #[arg(long)]
        strategy: Option<BranchStrategy>,

        /// Stop after this many features
        #[arg(long)]
        max_features: Option<usize>,

        /// Run the eval sidecar alongside the build
        #[arg(long)]
        eval_sidecar: bool,
    },
    /// Print the resolved build order
    Order,
    /// Watch for new commits and evaluate each one
    Eval {
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Mechanical checks only
        #[arg(long)]
        no_agent: bool,

        /// Where eval records are written
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Write a campaign summary from the eval records on disk
    Campaign {
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Check the frontmatter of feature spec files
    ValidateSpec {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the resume checkpoint and lock holder
    Status,
}

/// Console output plus a plain-text file under `logs/` when the project has
/// one. The returned guard flushes the file writer on drop.
fn init_tracing(
    verbose: bool,
    project_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let log_dir = project_dir.join(LOG_DIR);
    let (file_layer, guard) = if log_dir.is_dir() {
        let appender = tracing_appender::rolling::never(&log_dir, "auto-sdd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    guard
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("Cannot listen for SIGTERM: {}", e);
                        let _ = tokio::signal::ctrl_c().await;
                        token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::warn!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::warn!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}

async fn run(cli: Cli, project_dir: PathBuf, cancel: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Build {
            resume,
            strategy,
            max_features,
            eval_sidecar,
        } => {
            let overrides = auto_sdd::config::CliOverrides {
                branch_strategy: strategy,
                max_features,
                resume,
                eval_sidecar,
                verbose: cli.verbose,
                ..Default::default()
            };
            cmd::cmd_build(&project_dir, overrides, cancel).await
        }
        Commands::Order => cmd::cmd_order(&project_dir),
        Commands::Eval {
            interval,
            no_agent,
            output_dir,
        } => {
            let overrides = auto_sdd::config::CliOverrides {
                eval_interval_secs: interval,
                eval_agent: no_agent.then_some(false),
                eval_output_dir: output_dir,
                verbose: cli.verbose,
                ..Default::default()
            };
            cmd::cmd_eval(&project_dir, overrides, cancel).await
        }
        Commands::Campaign { output_dir } => cmd::cmd_campaign(&project_dir, output_dir),
        Commands::ValidateSpec { files } => cmd::cmd_validate_spec(&project_dir, &files),
        Commands::Status => cmd::cmd_status(&project_dir),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir().context("Failed to get current directory") {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        },
    };

    let long_running = matches!(cli.command, Commands::Build { .. } | Commands::Eval { .. });
    if long_running && project_dir.is_dir() {
        let _ = std::fs::create_dir_all(project_dir.join(LOG_DIR));
    }
    let log_guard = init_tracing(cli.verbose, &project_dir);
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    if let Err(e) = run(cli, project_dir, cancel).await {
        eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
        // process::exit skips destructors; flush the file log first.
        drop(log_guard);
        std::process::exit(exit_code_for(&e));
    }
}
