use std::fmt;

/// Operating systems a build can target, named the way OCI platforms name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Os {
  Linux,
  Darwin,
  Windows,
}

impl Os {
  /// Detect the operating system this process runs on
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::Darwin),
      "windows" => Some(Self::Windows),
      _ => None,
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "linux" => Some(Self::Linux),
      "darwin" | "macos" => Some(Self::Darwin),
      "windows" => Some(Self::Windows),
      _ => None,
    }
  }

  /// Returns the OCI identifier for this OS
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::Darwin => "darwin",
      Self::Windows => "windows",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
