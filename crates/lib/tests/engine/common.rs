//! Shared helpers for engine integration tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;
use treebuild_lib::execute::{self, ExecuteConfig, ExecuteError, RunResult};
use treebuild_lib::manifest::Manifest;
use treebuild_lib::sandbox::SandboxMode;

/// Shell prelude: reads the request into `$req` and defines `opt KEY`, which
/// prints a scalar option.
pub const READ_OPTION: &str = r#"req=$(cat)
opt() { printf '%s' "$req" | sed "s/.*\"$1\":\"\{0,1\}\([^\",}]*\).*/\1/"; }"#;

/// Isolated store, module library and output directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    fs::create_dir_all(env.libdir()).unwrap();
    env.install_standard_modules();
    env
  }

  pub fn store(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  pub fn libdir(&self) -> PathBuf {
    self.temp.path().join("lib")
  }

  pub fn output(&self) -> PathBuf {
    self.temp.path().join("output")
  }

  /// File steps append their name to when they run.
  pub fn log(&self) -> PathBuf {
    self.temp.path().join("steps.log")
  }

  pub fn logged(&self) -> Vec<String> {
    fs::read_to_string(self.log())
      .unwrap_or_default()
      .lines()
      .map(str::to_string)
      .collect()
  }

  /// Install a `/bin/sh` module into `<libdir>/<dir>/<name>`.
  pub fn module(&self, dir: &str, name: &str, body: &str) -> PathBuf {
    let path = self.libdir().join(dir).join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  fn install_standard_modules(&self) {
    let log = self.log();
    let log = log.display();

    self.module(
      "steps",
      "mkfile",
      &format!(
        r#"{READ_OPTION}
echo mkfile >> '{log}'
truncate -s "$(opt size)" "$TREEBUILD_TREE$(opt path)""#
      ),
    );
    self.module(
      "steps",
      "chmod",
      &format!(
        r#"{READ_OPTION}
echo chmod >> '{log}'
chmod "$(opt mode)" "$TREEBUILD_TREE$(opt path)""#
      ),
    );
    self.module(
      "steps",
      "write",
      &format!(
        r#"{READ_OPTION}
echo "write $(opt path)" >> '{log}'
printf '%s' "$(opt content)" > "$TREEBUILD_TREE$(opt path)""#
      ),
    );
    // copies the tree of its single input into the working tree
    self.module(
      "steps",
      "copy",
      &format!(
        r#"req=$(cat)
echo copy >> '{log}'
src=$(printf '%s' "$req" | sed 's/.*"path":"\([^"]*\)"}}}},"meta".*/\1/')
cp -a "$src/." "$TREEBUILD_TREE/""#
      ),
    );
    // fails while the marker file exists
    self.module(
      "steps",
      "flaky",
      &format!(
        r#"cat > /dev/null
echo flaky >> '{log}'
if [ -e '{marker}' ]; then echo 'flaky failure' >&2; exit 1; fi"#,
        marker = self.marker().display()
      ),
    );
  }

  pub fn marker(&self) -> PathBuf {
    self.temp.path().join("fail")
  }

  pub fn config(&self, exports: &[&str]) -> ExecuteConfig {
    ExecuteConfig {
      store: self.store(),
      libdir: self.libdir(),
      sandbox: SandboxMode::Host,
      parallelism: 2,
      exports: exports.iter().map(|s| s.to_string()).collect(),
      ..ExecuteConfig::default()
    }
  }

  pub async fn run(&self, manifest: &Value, config: &ExecuteConfig) -> Result<RunResult, ExecuteError> {
    let manifest = Manifest::from_slice(manifest.to_string().as_bytes()).unwrap();
    execute::run(manifest, config).await
  }

  /// Number of committed store objects.
  pub fn object_count(&self) -> usize {
    match fs::read_dir(self.store().join("objects")) {
      Ok(entries) => entries.count(),
      Err(_) => 0,
    }
  }
}

pub fn mode_of(path: &Path) -> u32 {
  fs::metadata(path).unwrap().permissions().mode() & 0o777
}
