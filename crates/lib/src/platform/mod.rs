//! Target platforms in OCI notation (`os/arch[/variant]`).

pub mod arch;
pub mod os;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use arch::Arch;
pub use os::Os;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
  #[error("invalid platform {0:?}: expected os/arch[/variant]")]
  Malformed(String),

  #[error("unsupported operating system {0:?}")]
  UnknownOs(String),

  #[error("unsupported architecture {0:?}")]
  UnknownArch(String),

  #[error("host platform is not supported")]
  UnsupportedHost,
}

/// A build target platform, e.g. `linux/arm64`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
  pub os: Os,
  pub arch: Arch,
  pub variant: Option<String>,
}

impl Platform {
  pub fn new(os: Os, arch: Arch) -> Self {
    Self { os, arch, variant: None }
  }

  /// The platform of the machine running this process. Images default to it.
  pub fn host() -> Result<Self, PlatformError> {
    Ok(Self::new(
      Os::current().ok_or(PlatformError::UnsupportedHost)?,
      Arch::current().ok_or(PlatformError::UnsupportedHost)?,
    ))
  }

  /// Returns `target` if set, otherwise the host platform.
  pub fn or_host(target: Option<Platform>) -> Result<Self, PlatformError> {
    match target {
      Some(p) => Ok(p),
      None => Self::host(),
    }
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.os, self.arch)?;
    if let Some(variant) = &self.variant {
      write!(f, "/{}", variant)?;
    }
    Ok(())
  }
}

impl FromStr for Platform {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split('/').collect();
    if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
      return Err(PlatformError::Malformed(s.to_string()));
    }

    let os = Os::parse(parts[0]).ok_or_else(|| PlatformError::UnknownOs(parts[0].to_string()))?;
    let arch = Arch::parse(parts[1]).ok_or_else(|| PlatformError::UnknownArch(parts[1].to_string()))?;

    Ok(Self {
      os,
      arch,
      variant: parts.get(2).map(|v| v.to_string()),
    })
  }
}

impl TryFrom<String> for Platform {
  type Error = PlatformError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Platform> for String {
  fn from(p: Platform) -> Self {
    p.to_string()
  }
}
