use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod cmd;

#[derive(Parser)]
#[command(name = "draftline")]
#[command(version, about = "Checkpointed pipeline engine for long-form text orders")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one order through the pipeline
    Run {
        /// Order file (JSON brief, optionally with an "order_id")
        #[arg(short, long)]
        order: PathBuf,

        /// Write the final text here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Resume every run interrupted by a previous process
    Resume,
    /// Show the latest checkpointed state of an order
    Status { order_id: String },
    /// List every checkpoint recorded for an order
    Checkpoints { order_id: String },
    /// List orders known to the order store
    Orders,
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default draftline.toml
    Init,
}

/// Install the stderr subscriber plus an optional daily log file.
///
/// The returned guard must live until exit so buffered file output is flushed.
fn init_logging(format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("draftline=info"));

    let stderr = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "draftline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(stderr.with_filter(filter()))
        .with(file)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work on a broken or missing config file.
    if let Commands::Config { command } = &cli.command {
        let _guard = init_logging(cli.log_format, None);
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = draftline::config::DraftlineConfig::new(project_dir)?;
    let _guard = init_logging(cli.log_format, config.log_dir().as_deref());

    match &cli.command {
        Commands::Run { order, out } => cmd::cmd_run(&config, order, out.as_deref()).await?,
        Commands::Resume => cmd::cmd_resume(&config).await?,
        Commands::Status { order_id } => cmd::cmd_status(&config, order_id).await?,
        Commands::Checkpoints { order_id } => cmd::cmd_checkpoints(&config, order_id).await?,
        Commands::Orders => cmd::cmd_orders(&config).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
