use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "crewforge")]
#[command(version, about = "Drive a team of AI agents from manifesto to merged pull request")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true, env = "CREWFORGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full workflow for a project manifesto
    Run(RunArgs),
    /// List change requests on the configured repository
    Prs {
        #[arg(long, value_enum, default_value = "open")]
        state: PrStateArg,
        /// Repository slug or URL (overrides crewforge.toml)
        #[arg(long, env = "CREWFORGE_REPO")]
        repo: Option<String>,
    },
    /// Show previous runs recorded in the audit directory
    History {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// View or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// File holding the project manifesto
    pub manifesto_file: Option<PathBuf>,

    /// Manifesto text given inline
    #[arg(short, long, conflicts_with = "manifesto_file")]
    pub manifesto: Option<String>,

    /// Approve every checkpoint without asking
    #[arg(long)]
    pub yes: bool,

    /// Skip opening a change request
    #[arg(long)]
    pub no_pr: bool,

    /// Merge the change request after it is opened
    #[arg(long, conflicts_with = "no_pr")]
    pub auto_merge: bool,

    /// Context budget in tokens
    #[arg(long)]
    pub budget: Option<u64>,

    /// Passes over the workflow before giving up on failing tests or an unmerged change request
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Repository slug or URL (overrides crewforge.toml)
    #[arg(long, env = "CREWFORGE_REPO")]
    pub repo: Option<String>,

    /// Branch holding the generated work
    #[arg(long)]
    pub head: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PrStateArg {
    Open,
    Closed,
    All,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("--log-file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, text_layer) = if cli.log_json {
        (
            Some(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(filter()),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(filter()),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(&cli)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&project_dir, args).await?,
        Commands::Prs { state, repo } => cmd::cmd_prs(&project_dir, *state, repo.clone()).await?,
        Commands::History { limit } => cmd::cmd_history(&project_dir, *limit)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
