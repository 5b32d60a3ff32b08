//! Shared test helpers for CLI integration tests.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own store, module library and output directory.
pub struct TestEnv {
  pub temp: TempDir,
  pub manifest_path: PathBuf,
}

impl TestEnv {
  /// Create an environment holding `manifest` and the standard test modules.
  pub fn with_manifest(manifest: &Value) -> Self {
    let env = Self::empty();
    env.write_file("manifest.json", &manifest.to_string());
    env.install_modules();
    env
  }

  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    let manifest_path = temp.path().join("manifest.json");
    Self { temp, manifest_path }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Install an executable step module.
  pub fn step(&self, name: &str, body: &str) {
    let path = self.write_file(&format!("lib/steps/{name}"), &format!("#!/bin/sh\n{body}\n"));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  fn install_modules(&self) {
    self.step("touch", r#"cat > /dev/null; echo touched; touch "$TREEBUILD_TREE/touched""#);
    self.step("fail", "cat > /dev/null; echo 'disk on fire' >&2; exit 1");
  }

  pub fn store_path(&self) -> PathBuf {
    let p = self.temp.path().join("store");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn lib_path(&self) -> PathBuf {
    let p = self.temp.path().join("lib");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn output_path(&self) -> PathBuf {
    let p = self.temp.path().join("output");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a pre-configured Command for the treebuild binary.
  ///
  /// The store and library are passed through `TREEBUILD_STORE` and
  /// `TREEBUILD_LIBDIR`; steps run in host mode.
  pub fn treebuild_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("treebuild");
    cmd.env("TREEBUILD_STORE", self.store_path());
    cmd.env("TREEBUILD_LIBDIR", self.lib_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `treebuild build <manifest> --sandbox host` with extra arguments.
  pub fn build_cmd(&self, args: &[&str]) -> Command {
    let mut cmd = self.treebuild_cmd();
    cmd.arg("build").arg(&self.manifest_path).args(["--sandbox", "host"]).args(args);
    cmd
  }

  /// Number of committed store objects.
  pub fn object_count(&self) -> usize {
    std::fs::read_dir(self.store_path().join("objects"))
      .map(|entries| entries.count())
      .unwrap_or(0)
  }
}

pub fn stdout_json(output: &std::process::Output) -> Value {
  serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
    panic!(
      "stdout is not JSON ({e}): {}",
      String::from_utf8_lossy(&output.stdout)
    )
  })
}
