//! Test utilities for treebuild-lib.
//!
//! Tests drive real module executables. These helpers write small shell
//! scripts into a temporary library directory laid out like an installed one.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::modules::ModuleKind;

/// A temporary module library directory.
pub struct TestLibdir {
  pub dir: TempDir,
}

impl TestLibdir {
  pub fn new() -> Self {
    Self {
      dir: TempDir::new().unwrap(),
    }
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Install a `/bin/sh` module of the given kind and return its path.
  pub fn script(&self, kind: ModuleKind, name: &str, body: &str) -> PathBuf {
    let dir = self.dir.path().join(kind.dir_name());
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  /// Install the sidecar metadata document for a module.
  pub fn meta(&self, kind: ModuleKind, name: &str, meta: serde_json::Value) {
    let dir = self.dir.path().join(kind.dir_name());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{name}.meta.json")), meta.to_string()).unwrap();
  }
}

/// Returns the shell command and args to execute a shell script.
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}
