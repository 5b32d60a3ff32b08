//! Store entry metadata and errors.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::util::hash::ObjectId;

pub const META_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create store directory {path}: {source}")]
  Create {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("store I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to commit object {id}: {source}")]
  Commit {
    id: ObjectId,
    #[source]
    source: io::Error,
  },

  #[error("invalid store metadata {path}: {message}")]
  Metadata { path: PathBuf, message: String },
}

impl StoreError {
  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    StoreError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// What one step run recorded: captured output and module-provided metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
  pub id: ObjectId,
  #[serde(rename = "type")]
  pub kind: String,
  pub duration_ms: u64,
  #[serde(default)]
  pub stdout: String,
  #[serde(default)]
  pub stderr: String,
  #[serde(default, skip_serializing_if = "Value::is_null")]
  pub metadata: Value,
}

/// Contents of `objects/<id>/meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
  pub version: u32,
  pub id: ObjectId,
  /// Pipeline that produced the tree.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pipeline: Option<String>,
  /// Steps run to produce the tree, in order. Steps reused from an earlier
  /// entry are not repeated here.
  #[serde(default)]
  pub steps: Vec<StepRecord>,
  pub duration_ms: u64,
}

impl ObjectMeta {
  pub fn new(id: ObjectId, pipeline: Option<String>, steps: Vec<StepRecord>) -> Self {
    let duration_ms = steps.iter().map(|s| s.duration_ms).sum();
    Self {
      version: META_VERSION,
      id,
      pipeline,
      steps,
      duration_ms,
    }
  }
}

/// Contents of `failures/<id>.json`, written when a step fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
  pub pipeline: String,
  pub step: StepRecord,
  pub error: String,
}

/// Store-level settings persisted in `store.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
  /// Byte budget enforced by garbage collection.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_size: Option<u64>,
}

/// A committed, immutable tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHandle {
  pub id: ObjectId,
  /// `objects/<id>`
  pub root: PathBuf,
}

impl TreeHandle {
  /// The filesystem tree itself.
  pub fn tree(&self) -> PathBuf {
    self.root.join("tree")
  }

  pub fn meta_path(&self) -> PathBuf {
    self.root.join("meta.json")
  }

  pub fn meta(&self) -> Result<ObjectMeta, StoreError> {
    let path = self.meta_path();
    let bytes = std::fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Metadata {
      path,
      message: e.to_string(),
    })
  }
}

/// One committed object as seen by garbage collection.
#[derive(Debug, Clone, Serialize)]
pub struct StoreEntry {
  pub id: ObjectId,
  pub path: PathBuf,
  pub size: u64,
  /// Last access, seconds since the epoch.
  pub last_used: i64,
}
