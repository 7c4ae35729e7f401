//! Crate-wide constants.

/// Application name used for temp directory prefixes and user-facing messages.
pub const APP_NAME: &str = "solvent";

/// Bumped whenever the cache key layout changes, invalidating every previous key.
pub const CACHE_KEY_VERSION: u32 = 1;

/// Upper bound on the total size of a single local content set shipped to the daemon.
pub const MAX_WORKSPACE_SIZE: u64 = 32 * 1024 * 1024;

/// How many files the workspace size error lists.
pub const LARGEST_FILES_REPORTED: usize = 10;

/// Container used for the managed daemon when no address or name is configured.
pub const DEFAULT_CONTAINER_NAME: &str = "fn-buildkitd";

/// Daemon image the managed container must run. Any other image counts as drift.
pub const DAEMON_IMAGE: &str = "moby/buildkit:v0.11.6";

/// State directory inside the daemon container, backed by a named volume.
pub const DAEMON_STATE_DIR: &str = "/var/lib/buildkit";

/// Readiness probing gives up after this many attempts.
pub const READINESS_MAX_ATTEMPTS: u32 = 10;

/// Scope applied to GitHub Actions cache entries that do not name one.
pub const GHA_DEFAULT_SCOPE: &str = "solvent-cache";

pub const GHA_TOKEN_ENV: &str = "ACTIONS_RUNTIME_TOKEN";
pub const GHA_URL_ENV: &str = "ACTIONS_CACHE_URL";
pub const SSH_AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Session id for the forwarded SSH agent.
pub const SSH_AGENT_PROVIDER_ID: &str = "default";

/// Directory patterns never shipped to the daemon.
pub const BASE_EXCLUDE_PATTERNS: &[&str] = &[
  ".git",
  ".hg",
  ".svn",
  ".cache",
  ".parcel-cache",
  ".next",
  ".turbo",
  ".devcontainer",
  ".vscode",
  ".idea",
  "node_modules/.cache",
];

/// Host-only configuration file that must stay on the caller's machine.
pub const DEVHOST_FILENAME: &str = "devhost.textpb";

/// Name of the per-action buffer holding the human readable progress log.
pub const TEXT_LOG_OUTPUT: &str = "text.log";

/// Name of the per-action buffer holding raw progress events as JSON lines.
pub const JSON_LOG_OUTPUT: &str = "buildkit.json";

/// Number of trailing lines taken from each relevant buffer when decorating an error.
pub const ERROR_LOG_TAIL_LINES: usize = 5;

/// Length of the random session id used to correlate log lines.
pub const SESSION_ID_LEN: usize = 8;
