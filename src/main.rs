use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about = "Lifecycle orchestrator for worker-driven delivery epics")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip interactive confirmations
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process every pending epic in id order, then finalize
    Run,
    /// Process a single epic by id
    Epic { id: u32 },
    /// List epics with their detected phases
    List,
    /// Show the live status snapshot
    Status,
    /// Re-run the project checks with worker-assisted fixing
    Finalize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run => cmd::run_all(&cli, project_dir).await?,
        Commands::Epic { id } => cmd::run_epic(&cli, project_dir, *id).await?,
        Commands::List => cmd::cmd_list(&cli, project_dir)?,
        Commands::Status => cmd::cmd_status(&cli, project_dir)?,
        Commands::Finalize => cmd::run_finalize(&cli, project_dir).await?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "drover=debug" } else { "drover=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
