mod build;
mod gc;
mod inspect;

pub use build::{BuildArgs, cmd_build};
pub use gc::{GcArgs, cmd_gc};
pub use inspect::{InspectArgs, cmd_inspect};

use std::fmt;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use treebuild_lib::manifest::Manifest;

/// Process exit codes.
pub mod exit {
  use treebuild_lib::execute::ExecuteError;
  use treebuild_lib::manifest::ManifestError;
  use treebuild_lib::resolve::ValidationError;

  use super::UsageError;

  pub const SUCCESS: u8 = 0;
  /// A pipeline, source or store failure.
  pub const FAILURE: u8 = 1;
  /// Invalid arguments or an invalid manifest.
  pub const INVALID: u8 = 2;
  pub const NO_STDIO: u8 = 3;
  pub const INTERRUPTED: u8 = 130;

  pub fn for_execute(err: &ExecuteError) -> u8 {
    match err.kind() {
      "validation" => INVALID,
      "interrupted" => INTERRUPTED,
      _ => FAILURE,
    }
  }

  pub fn code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
      if cause.is::<UsageError>() || cause.is::<ManifestError>() || cause.is::<ValidationError>() {
        return INVALID;
      }
      if let Some(err) = cause.downcast_ref::<ExecuteError>() {
        return for_execute(err);
      }
    }
    FAILURE
  }
}

/// A bad command-line argument or argument file.
#[derive(Debug)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for UsageError {}

/// Load a manifest from a file, or from standard input when `path` is `-`.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
  if path == Path::new("-") {
    let mut bytes = Vec::new();
    std::io::stdin()
      .read_to_end(&mut bytes)
      .context("Failed to read manifest from standard input")?;
    return Ok(Manifest::from_slice(&bytes)?);
  }
  Ok(Manifest::load(path)?)
}

/// Parse a JSON argument file such as `--secrets` or `--build-env`.
pub fn read_json_file<T: DeserializeOwned>(flag: &str, path: &Path) -> Result<T> {
  let bytes = std::fs::read(path).map_err(|e| UsageError(format!("{flag}: cannot read {}: {e}", path.display())))?;
  serde_json::from_slice(&bytes)
    .map_err(|e| UsageError(format!("{flag}: {} is not valid: {e}", path.display())).into())
}
