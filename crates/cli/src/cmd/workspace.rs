//! Implementation of the `solvent workspace` commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Subcommand;

use solvent_lib::consts::LARGEST_FILES_REPORTED;
use solvent_lib::util::format_bytes;
use solvent_lib::workspace::{LocalView, SizeGuard, WorkspaceError};

use crate::output::{OutputFormat, print_error, print_json, print_stat, print_success};

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
  /// Check a directory against the workspace size limit
  Check {
    path: PathBuf,

    /// Limit in bytes (defaults to the built-in ceiling)
    #[arg(long)]
    limit: Option<u64>,

    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Print the digest of a directory's filtered contents
  Digest { path: PathBuf },
}

pub fn cmd_workspace(command: WorkspaceCommand) -> Result<()> {
  match command {
    WorkspaceCommand::Check { path, limit, format } => check(path, limit, format),
    WorkspaceCommand::Digest { path } => {
      let digest = LocalView::new(path).digest()?;
      println!("{}", digest.to_digest());
      Ok(())
    }
  }
}

fn check(path: PathBuf, limit: Option<u64>, format: OutputFormat) -> Result<()> {
  let guard = limit.map(SizeGuard::new).unwrap_or_default();
  let view = LocalView::new(&path);
  let name = path.display().to_string();

  match guard.check(&name, &view) {
    Ok(total) => {
      if format.is_json() {
        let largest = view.largest_files(LARGEST_FILES_REPORTED)?;
        return print_json(&serde_json::json!({
          "path": name,
          "total": total,
          "limit": guard.limit(),
          "largest": largest,
        }));
      }
      print_success(&format!("{name} is within the workspace size limit"));
      print_stat("Total", &format_bytes(total));
      print_stat("Limit", &format_bytes(guard.limit()));
      Ok(())
    }
    Err(e @ WorkspaceError::TooLarge { .. }) => {
      print_error(&e.to_string());
      bail!("workspace size check failed for {name}");
    }
    Err(e) => Err(e.into()),
  }
}
