//! trainsweep CLI: plan, check and run trainer sweeps.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use trainsweep_core::Label;
use trainsweep_core::training::RunStatus;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// trainsweep: run trainer invocations one after another, and keep score
#[derive(Parser, Debug)]
#[command(name = "trainsweep", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate driver scripts (.sh) and sweep manifests (.toml)
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the runs a script or manifest expands to
    Plan {
        file: PathBuf,
        /// Only include runs with this label (repeatable)
        #[arg(long)]
        only: Vec<Label>,
    },
    /// Run every invocation of a script or manifest, one at a time
    Run {
        file: PathBuf,
        /// Print the commands without starting anything
        #[arg(long)]
        dry_run: bool,
        /// Only run invocations with this label (repeatable)
        #[arg(long)]
        only: Vec<Label>,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Run the trainer with the given flags, optionally once per label
    ///
    /// Trainer flags follow `--`, e.g.
    /// `trainsweep train --labels mask,gender,age -- --epochs 30 --name effb4`
    Train {
        /// Run once per label, suffixing the run name with the label
        #[arg(long, value_delimiter = ',')]
        labels: Vec<Label>,
        /// Print the commands without starting anything
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        exec: ExecArgs,
        /// Trainer flags
        #[arg(last = true)]
        flags: Vec<String>,
    },
    /// Random hyperparameter search described by a manifest's [search] table
    Search {
        manifest: PathBuf,
        /// Print the trials without starting anything
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Show past sweeps recorded in the workspace
    History {
        /// Show one sweep in detail (id or id prefix)
        id: Option<String>,
        /// List runs with this status instead of sweeps
        #[arg(long)]
        status: Option<RunStatus>,
        /// Maximum number of entries
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Execution overrides shared by the commands that start trainers.
#[derive(clap::Args, Debug, Default, Clone)]
struct ExecArgs {
    /// Keep going after a failed run
    #[arg(long)]
    continue_on_failure: bool,
    /// Per-run time limit in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Mirror trainer output to the terminal
    #[arg(long)]
    echo: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .trainsweep/config.toml in the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = trainsweep_core::load_config(Some(&workspace), cli.config.as_deref());

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = config
        .as_ref()
        .ok()
        .and_then(|c| c.logging.log_dir.clone())
        .or_else(|| {
            directories::ProjectDirs::from("dev", "trainsweep", "trainsweep")
                .map(|d| d.data_dir().join("logs"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trainsweep.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let config = config.map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;
    commands::handle_command(cli.command, config, &workspace).await
}
