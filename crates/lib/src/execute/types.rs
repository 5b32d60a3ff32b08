//! Types for running a manifest.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::manifest::{ManifestError, PipelineDesc};
use crate::resolve::ValidationError;
use crate::sandbox::{SandboxError, SandboxMode};
use crate::sources::SourceError;
use crate::store::{StepRecord, StoreError};
use crate::store_lock::StoreLockError;
use crate::util::hash::ObjectId;

/// Errors that end a run. A failing step is not one of them: it is reported
/// in the [`RunResult`].
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("unknown export '{0}'")]
  UnknownExport(String),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("sandbox error: {0}")]
  Sandbox(#[from] SandboxError),

  #[error("pipeline '{pipeline}' ({id}) is missing from the store")]
  MissingTree { pipeline: String, id: ObjectId },

  #[error("failed to export '{name}' to {path}: {source}")]
  Export {
    name: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("interrupted")]
  Interrupted,
}

impl ExecuteError {
  /// Short machine-readable category, used in the error document.
  pub fn kind(&self) -> &'static str {
    match self {
      ExecuteError::Manifest(_) | ExecuteError::Validation(_) | ExecuteError::UnknownExport(_) => "validation",
      ExecuteError::Source(SourceError::Integrity { .. }) => "integrity",
      ExecuteError::Source(_) => "source",
      ExecuteError::Store(_)
      | ExecuteError::Lock(_)
      | ExecuteError::MissingTree { .. }
      | ExecuteError::Export { .. } => "store",
      ExecuteError::Sandbox(_) => "sandbox",
      ExecuteError::Interrupted => "interrupted",
    }
  }
}

/// Configuration for one run.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  pub store: PathBuf,
  pub libdir: PathBuf,
  /// Upper bound on concurrent source fetches and store lookups.
  pub parallelism: usize,
  pub sandbox: SandboxMode,
  pub step_timeout: Option<Duration>,
  /// Exports are copied to `<output_dir>/<name>` when set.
  pub output_dir: Option<PathBuf>,
  /// Pipeline names or step ids whose trees are kept in the store.
  pub checkpoints: Vec<String>,
  /// Pipelines to produce.
  pub exports: Vec<String>,
  /// Checked before every step; set it to stop the run.
  pub interrupt: Arc<AtomicBool>,
  /// Per-source-type secrets for external source modules.
  pub secrets: BTreeMap<String, Value>,
  /// Pipeline used as the build root of pipelines that name none.
  pub build_env: Option<PipelineDesc>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      store: PathBuf::from(crate::consts::DEFAULT_STORE_DIR),
      libdir: PathBuf::from(crate::consts::DEFAULT_LIBDIR),
      parallelism: num_cpus(),
      sandbox: SandboxMode::Auto,
      step_timeout: None,
      output_dir: None,
      checkpoints: Vec::new(),
      exports: Vec::new(),
      interrupt: Arc::new(AtomicBool::new(false)),
      secrets: BTreeMap::new(),
      build_env: None,
    }
  }
}

impl ExecuteConfig {
  pub fn interrupted(&self) -> bool {
    self.interrupt.load(Ordering::SeqCst)
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
  pub id: ObjectId,
  #[serde(rename = "type")]
  pub kind: String,
  pub success: bool,
  /// Reused from the store instead of run.
  pub cached: bool,
  pub stdout: String,
  pub stderr: String,
  pub metadata: Value,
  pub duration_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl StepResult {
  pub(crate) fn cached(id: &ObjectId, kind: &str) -> Self {
    Self {
      id: id.clone(),
      kind: kind.to_string(),
      success: true,
      cached: true,
      stdout: String::new(),
      stderr: String::new(),
      metadata: Value::Null,
      duration_ms: 0,
      error: None,
    }
  }

  pub(crate) fn record(&self) -> StepRecord {
    StepRecord {
      id: self.id.clone(),
      kind: self.kind.clone(),
      duration_ms: self.duration_ms,
      stdout: self.stdout.clone(),
      stderr: self.stderr.clone(),
      metadata: self.metadata.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
  pub id: ObjectId,
  pub success: bool,
  /// The whole pipeline came from the store.
  pub cached: bool,
  pub steps: Vec<StepResult>,
}

impl PipelineResult {
  /// Steps actually run, as opposed to reused.
  pub fn executed(&self) -> usize {
    self.steps.iter().filter(|s| !s.cached).count()
  }
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
  pub pipeline: String,
  pub step: ObjectId,
  pub error: String,
  /// The `failures/<id>.json` record.
  pub record: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
  pub success: bool,
  /// Processed pipelines by name.
  pub pipelines: BTreeMap<String, PipelineResult>,
  /// Export name to the path holding its tree.
  pub exports: BTreeMap<String, PathBuf>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<RunFailure>,
}

impl RunResult {
  /// Steps run across all pipelines.
  pub fn executed_steps(&self) -> usize {
    self.pipelines.values().map(PipelineResult::executed).sum()
  }
}
