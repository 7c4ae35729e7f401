//! Implementation of the `solvent daemon` commands.

use anyhow::{Context, Result};
use clap::Subcommand;

use solvent_lib::config::EngineConfig;
use solvent_lib::daemon::{DaemonManager, DaemonState};

use super::DaemonArgs;
use crate::output::{print_info, print_stat, print_success, print_warning};

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
  /// Show the state of the managed daemon container
  Status(DaemonArgs),

  /// Install, start or upgrade the managed daemon container
  Ensure(DaemonArgs),

  /// Remove the managed daemon container
  Remove(DaemonArgs),
}

pub fn cmd_daemon(command: DaemonCommand) -> Result<()> {
  let manager = DaemonManager::from_config(&EngineConfig::default());
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;

  match command {
    DaemonCommand::Status(args) => {
      let config = args.to_config();
      match rt.block_on(manager.status(&config))? {
        None => print_info("Using an explicit daemon address; nothing is managed"),
        Some(DaemonState::Running) => print_success("Daemon is running"),
        Some(DaemonState::Stopped) => print_warning("Daemon is installed but stopped"),
        Some(DaemonState::NotInstalled) => print_warning("Daemon is not installed"),
        Some(DaemonState::Outdated { image }) => {
          print_warning("Daemon runs an outdated image");
          print_stat("Found", &image);
          print_stat("Wanted", &config.image);
        }
      }
    }
    DaemonCommand::Ensure(args) => {
      let addr = rt.block_on(manager.ensure(&args.to_config()))?;
      print_success("Daemon is running");
      print_stat("Address", &addr);
    }
    DaemonCommand::Remove(args) => {
      rt.block_on(manager.remove(&args.to_config()))?;
      print_success("Daemon removed");
    }
  }

  Ok(())
}
