//! Manifest loading.
//!
//! Parsing only checks the document shape. Reference resolution, schema
//! checks and identifiers are the resolver's job (see [`crate::resolve`]).

mod types;

pub use types::*;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::consts::{BUILD_ENV_PIPELINE, PIPELINE_REF_PREFIX};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("malformed manifest: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("cannot add build environment: a pipeline named '{0}' already exists")]
  BuildEnvConflict(String),
}

impl Manifest {
  /// Parse a manifest from raw bytes.
  pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
    Ok(serde_json::from_slice(bytes)?)
  }

  /// Read and parse a manifest file.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let bytes = std::fs::read(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_slice(&bytes)
  }

  pub fn pipeline(&self, name: &str) -> Option<&PipelineDesc> {
    self.pipelines.iter().find(|p| p.name == name)
  }

  /// Prepend a build-environment pipeline and make it the `build` of every
  /// pipeline that does not name one.
  pub fn with_build_env(mut self, mut env: PipelineDesc) -> Result<Self, ManifestError> {
    if self.pipeline(BUILD_ENV_PIPELINE).is_some() {
      return Err(ManifestError::BuildEnvConflict(BUILD_ENV_PIPELINE.to_string()));
    }
    env.name = BUILD_ENV_PIPELINE.to_string();
    for pipeline in &mut self.pipelines {
      if pipeline.build.is_none() {
        pipeline.build = Some(format!("{PIPELINE_REF_PREFIX}{BUILD_ENV_PIPELINE}"));
      }
    }
    self.pipelines.insert(0, env);
    Ok(self)
  }
}

/// Strip the optional `name:` prefix from a pipeline reference.
pub fn pipeline_ref_name(reference: &str) -> &str {
  reference.strip_prefix(PIPELINE_REF_PREFIX).unwrap_or(reference)
}
