//! CLI smoke tests for solvent.
//!
//! These run every command that does not need a live daemon and check exit codes and
//! the user-facing output.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

fn solvent_cmd() -> Command {
  let mut cmd = cargo_bin_cmd!("solvent");
  cmd.env_remove("ACTIONS_RUNTIME_TOKEN").env_remove("ACTIONS_CACHE_URL");
  cmd
}

fn temp_graph() -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("graph.bin"), b"serialized-graph").unwrap();
  std::fs::create_dir_all(temp.path().join("web/src")).unwrap();
  std::fs::write(temp.path().join("web/src/index.ts"), "export {}").unwrap();
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  solvent_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  solvent_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn build_help_lists_engine_flags() {
  solvent_cmd()
    .args(["build", "--help"])
    .assert()
    .success()
    .stdout(predicate::str::contains("--cache-from"))
    .stdout(predicate::str::contains("--skip-workspace-size-check"))
    .stdout(predicate::str::contains("--daemon-addr"));
}

// =============================================================================
// Build
// =============================================================================

#[test]
fn build_explain_describes_request() {
  let temp = temp_graph();
  solvent_cmd()
    .current_dir(temp.path())
    .args([
      "build",
      "--graph",
      "graph.bin",
      "--local",
      "web",
      "--module",
      "github.com/acme/site",
      "--platform",
      "linux/arm64",
      "--explain",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("linux/arm64"))
    .stdout(predicate::str::contains("github.com/acme/site/web"))
    .stdout(predicate::str::contains("sha256:"));
}

#[test]
fn build_without_graph_or_frontend_fails() {
  solvent_cmd()
    .args(["build", "--explain", "--platform", "linux/amd64"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("neither a build graph nor a frontend"));
}

#[test]
fn build_rejects_malformed_cache_flag() {
  let temp = temp_graph();
  solvent_cmd()
    .current_dir(temp.path())
    .args(["build", "--graph", "graph.bin", "--cache-to", "ref=ghcr.io/acme/cache"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("--cache-to"));
}

#[test]
#[serial]
fn gha_cache_without_credentials_fails_fast() {
  let temp = temp_graph();
  solvent_cmd()
    .current_dir(temp.path())
    .args([
      "build",
      "--graph",
      "graph.bin",
      "--platform",
      "linux/amd64",
      "--cache-to",
      "type=gha",
      "--daemon-addr",
      "tcp://127.0.0.1:1",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("ACTIONS_RUNTIME_TOKEN"));
}

#[test]
fn registry_export_requires_repository() {
  let temp = temp_graph();
  solvent_cmd()
    .current_dir(temp.path())
    .args(["build", "--graph", "graph.bin", "--platform", "linux/amd64", "--export", "registry"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("--push"));
}

// =============================================================================
// Workspace
// =============================================================================

#[test]
fn workspace_check_passes_small_directory() {
  let temp = temp_graph();
  solvent_cmd()
    .args(["workspace", "check"])
    .arg(temp.path().join("web"))
    .assert()
    .success()
    .stdout(predicate::str::contains("within the workspace size limit"));
}

#[test]
fn workspace_check_rejects_oversized_directory() {
  let temp = TempDir::new().unwrap();
  std::fs::File::create(temp.path().join("dump.bin"))
    .unwrap()
    .set_len(2048)
    .unwrap();

  solvent_cmd()
    .args(["workspace", "check", "--limit", "1024"])
    .arg(temp.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("dump.bin (2.0 KiB)"))
    .stderr(predicate::str::contains("--skip-workspace-size-check"));
}

#[test]
fn workspace_check_json_output() {
  let temp = temp_graph();
  let output = solvent_cmd()
    .args(["workspace", "check", "--format", "json"])
    .arg(temp.path().join("web"))
    .output()
    .unwrap();
  assert!(output.status.success());

  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value["total"], 9);
  assert_eq!(value["largest"][0]["path"], "src/index.ts");
}

#[test]
fn workspace_digest_is_stable() {
  let temp = temp_graph();
  let digest = |dir: &std::path::Path| {
    let output = solvent_cmd().args(["workspace", "digest"]).arg(dir).output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
  };

  let first = digest(&temp.path().join("web"));
  assert!(first.starts_with("sha256:"));
  std::fs::create_dir(temp.path().join("web/.git")).unwrap();
  std::fs::write(temp.path().join("web/.git/HEAD"), "ref").unwrap();
  assert_eq!(digest(&temp.path().join("web")), first);
}
