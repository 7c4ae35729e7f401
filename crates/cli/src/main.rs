mod cmd;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, DaemonCommand, WorkspaceCommand};

/// solvent - drive BuildKit builds with caching and diagnostics
#[derive(Parser)]
#[command(name = "solvent")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Solve a build graph or frontend and export the result
  Build(BuildArgs),

  /// Manage the build daemon container
  #[command(subcommand)]
  Daemon(DaemonCommand),

  /// Inspect local contents as they would be shipped to the daemon
  #[command(subcommand)]
  Workspace(WorkspaceCommand),
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => cmd::cmd_build(args),
    Commands::Daemon(command) => cmd::cmd_daemon(command),
    Commands::Workspace(command) => cmd::cmd_workspace(command),
  }
}
