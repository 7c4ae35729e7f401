use std::fmt;

/// CPU architectures a build can target, named the way OCI platforms name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
  Amd64,
  Arm64,
}

impl Arch {
  /// Detect the CPU architecture this process runs on
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86_64" => Some(Self::Amd64),
      "aarch64" => Some(Self::Arm64),
      _ => None,
    }
  }

  /// Accepts both OCI and Rust spellings.
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "amd64" | "x86_64" => Some(Self::Amd64),
      "arm64" | "aarch64" => Some(Self::Arm64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Amd64 => "amd64",
      Self::Arm64 => "arm64",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
