//! Per-solve session state.
//!
//! Each solve gets a fresh random session id and a set of attachments the daemon may
//! call back into: registry credentials from the local docker configuration, secrets,
//! and, when the caller runs an agent, SSH forwarding.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::action::Console;
use crate::consts::{SESSION_ID_LEN, SSH_AGENT_PROVIDER_ID, SSH_AUTH_SOCK_ENV};
use crate::util::random_base62;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
  #[error("bad secret definition {0:?}, expected {{name}}:env|file:{{value}}")]
  MalformedSecret(String),

  #[error("bad secret definition {definition:?}: expected env or file, got {kind:?}")]
  UnknownSecretKind { definition: String, kind: String },

  #[error("failed to generate session id: {0}")]
  SessionId(String),
}

/// Where the value of a secret comes from on the caller's machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
  Env(String),
  File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
  pub id: String,
  pub source: SecretSource,
}

/// Parses `{name}:env|file:{value}` definitions separated by `;`. Empty definitions are
/// skipped.
pub fn parse_secrets(spec: &str) -> Result<Vec<Secret>, SessionError> {
  let mut secrets = Vec::new();

  for def in spec.split(';') {
    if def.is_empty() {
      continue;
    }

    let parts: Vec<&str> = def.split(':').collect();
    let [id, kind, value] = parts.as_slice() else {
      return Err(SessionError::MalformedSecret(def.to_string()));
    };

    let source = match *kind {
      "env" => SecretSource::Env(value.to_string()),
      "file" => SecretSource::File(PathBuf::from(value)),
      other => {
        return Err(SessionError::UnknownSecretKind {
          definition: def.to_string(),
          kind: other.to_string(),
        });
      }
    };

    secrets.push(Secret {
      id: id.to_string(),
      source,
    });
  }

  Ok(secrets)
}

/// Something the daemon may call back into during a solve.
#[derive(Debug, Clone)]
pub enum Attachment {
  /// Registry credentials from the local docker configuration. Authentication problems
  /// are reported on `warnings`.
  DockerAuth { warnings: Console },
  Secrets(Vec<Secret>),
  SshAgent { id: String, socket: PathBuf },
}

#[derive(Debug, Clone)]
pub struct SolveSession {
  pub id: String,
  pub attachments: Vec<Attachment>,
}

impl SolveSession {
  /// Builds the attachments for one solve. SSH forwarding is attached only when
  /// `SSH_AUTH_SOCK` is set.
  pub fn prepare(secrets: &str, warnings: Console) -> Result<Self, SessionError> {
    let id = random_base62(SESSION_ID_LEN).map_err(|e| SessionError::SessionId(e.to_string()))?;

    let mut attachments = vec![
      Attachment::Secrets(parse_secrets(secrets)?),
      Attachment::DockerAuth { warnings },
    ];

    if let Some(socket) = std::env::var_os(SSH_AUTH_SOCK_ENV).filter(|s| !s.is_empty()) {
      attachments.push(Attachment::SshAgent {
        id: SSH_AGENT_PROVIDER_ID.to_string(),
        socket: PathBuf::from(socket),
      });
    }

    debug!(session = %id, attachments = attachments.len(), "prepared session");
    Ok(Self { id, attachments })
  }

  pub fn secrets(&self) -> impl Iterator<Item = &Secret> {
    self
      .attachments
      .iter()
      .filter_map(|a| match a {
        Attachment::Secrets(secrets) => Some(secrets),
        _ => None,
      })
      .flatten()
  }

  /// Console the transport reports registry authentication problems on.
  pub fn auth_warnings(&self) -> Option<&Console> {
    self.attachments.iter().find_map(|a| match a {
      Attachment::DockerAuth { warnings } => Some(warnings),
      _ => None,
    })
  }

  pub fn ssh_agent(&self) -> Option<(&str, &PathBuf)> {
    self.attachments.iter().find_map(|a| match a {
      Attachment::SshAgent { id, socket } => Some((id.as_str(), socket)),
      _ => None,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn parses_env_and_file_secrets() {
    let secrets = parse_secrets("npm:env:NPM_TOKEN;;ssh_key:file:/home/me/.ssh/id").unwrap();
    assert_eq!(
      secrets,
      vec![
        Secret {
          id: "npm".to_string(),
          source: SecretSource::Env("NPM_TOKEN".to_string()),
        },
        Secret {
          id: "ssh_key".to_string(),
          source: SecretSource::File(PathBuf::from("/home/me/.ssh/id")),
        },
      ]
    );
  }

  #[test]
  fn rejects_malformed_secrets() {
    assert!(matches!(parse_secrets("npm:env"), Err(SessionError::MalformedSecret(_))));
    assert!(matches!(
      parse_secrets("npm:vault:x"),
      Err(SessionError::UnknownSecretKind { kind, .. }) if kind == "vault"
    ));
  }

  #[test]
  #[serial]
  fn ssh_agent_only_when_socket_is_set() {
    temp_env::with_var(SSH_AUTH_SOCK_ENV, Some("/tmp/agent.sock"), || {
      let session = SolveSession::prepare("", Console::Discard).unwrap();
      let (id, socket) = session.ssh_agent().unwrap();
      assert_eq!(id, SSH_AGENT_PROVIDER_ID);
      assert_eq!(socket, &PathBuf::from("/tmp/agent.sock"));
    });

    temp_env::with_var(SSH_AUTH_SOCK_ENV, None::<&str>, || {
      let session = SolveSession::prepare("", Console::Discard).unwrap();
      assert!(session.ssh_agent().is_none());
      assert_eq!(session.id.len(), SESSION_ID_LEN);
    });
  }

  #[test]
  #[serial]
  fn always_attaches_docker_auth_and_secrets() {
    temp_env::with_var(SSH_AUTH_SOCK_ENV, None::<&str>, || {
      let session = SolveSession::prepare("a:env:A", Console::Discard).unwrap();
      assert!(session.attachments.iter().any(|a| matches!(a, Attachment::DockerAuth { .. })));
      assert_eq!(session.secrets().count(), 1);
    });
  }
}
