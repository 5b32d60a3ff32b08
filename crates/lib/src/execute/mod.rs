//! Running a manifest.
//!
//! [`run`] resolves a manifest and builds the pipelines needed for the
//! requested exports:
//!
//! 1. Every pipeline and step id in the export subgraph is looked up in the
//!    store, in parallel.
//! 2. Pipelines are selected by walking back from the exports. A cached
//!    pipeline ends the walk: its own dependencies are not needed.
//! 3. Sources referenced by the selected pipelines are fetched and verified.
//! 4. Pipelines are built in dependency order. Each starts from the latest
//!    cached step of its chain, or from an empty tree, and runs the rest of
//!    its steps in a [`Sandbox`].
//! 5. A finished pipeline is committed when it is checkpointed, needed by a
//!    later pipeline, or exported without an output directory.
//!
//! The first failing step ends the run. Entries committed before it stay in
//! the store for the next run.

pub mod report;
mod types;

pub use types::*;

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::manifest::{InputOrigin, Manifest, pipeline_ref_name};
use crate::modules::ModuleRegistry;
use crate::resolve::dag::DagError;
use crate::resolve::{ResolvedManifest, ResolvedPipeline, ResolvedSource, resolve};
use crate::sandbox::{Sandbox, StepEnv};
use crate::sources::{FetchOptions, fetch_all};
use crate::store::{FailureRecord, ObjectMeta, Store, TreeHandle, WriteHandle};
use crate::store_lock::{LockMode, StoreLock};
use crate::util::fs::{copy_tree, remove_tree};
use crate::util::hash::ObjectId;

/// Resolve `manifest` and build the configured exports.
///
/// Holds a shared lock on the store for the whole run.
pub async fn run(manifest: Manifest, config: &ExecuteConfig) -> Result<RunResult, ExecuteError> {
  let manifest = match &config.build_env {
    Some(env) => manifest.with_build_env(env.clone())?,
    None => manifest,
  };

  let registry = ModuleRegistry::new(&config.libdir);
  let resolved = resolve(&manifest, &registry)?;
  info!(pipelines = resolved.pipelines.len(), "manifest resolved");

  let _lock = StoreLock::acquire(&config.store, LockMode::Shared, "build")?;
  let store = Store::open(&config.store)?;
  run_resolved(&resolved, &store, config).await
}

/// Build the configured exports of an already resolved manifest.
pub async fn run_resolved(
  resolved: &ResolvedManifest,
  store: &Store,
  config: &ExecuteConfig,
) -> Result<RunResult, ExecuteError> {
  let required = resolved.dag.required(&config.exports).map_err(|e| match e {
    DagError::UnknownPipeline(name) | DagError::CycleDetected(name) => ExecuteError::UnknownExport(name),
  })?;

  let ids: BTreeSet<ObjectId> = required
    .iter()
    .filter_map(|name| resolved.pipeline(name))
    .flat_map(|p| std::iter::once(p.id.clone()).chain(p.steps.iter().map(|s| s.id.clone())))
    .collect();
  let cached = cached_ids(store, ids, config.parallelism).await;
  debug!(checked = required.len(), cached = cached.len(), "store checked");

  let plan = depsolve(resolved, &config.exports, &required, &cached)?;
  info!(
    required = required.len(),
    to_build = plan.iter().filter(|p| !cached.contains(&p.id)).count(),
    "build plan ready"
  );

  let sources = referenced_sources(resolved, &plan, &cached);
  if !sources.is_empty() {
    let options = FetchOptions {
      parallelism: config.parallelism,
      secrets: config.secrets.clone(),
      timeout: config.step_timeout,
    };
    fetch_all(&sources, store, &options).await?;
  }

  let mut runner = Runner {
    store,
    config,
    resolved,
    sandbox: Sandbox::new(store.clone(), config.sandbox, config.step_timeout),
    cached,
    planned: plan.iter().map(|p| p.name.clone()).collect(),
    result: RunResult::default(),
  };
  debug!(mode = %runner.sandbox.mode(), "sandbox selected");

  let mut trees = Vec::new();
  for pipeline in &plan {
    if config.interrupted() {
      warn!("interrupted, not starting further pipelines");
      return Err(ExecuteError::Interrupted);
    }
    match runner.build(pipeline).await? {
      Some(tree) => trees.push((pipeline.name.clone(), tree)),
      None => {
        runner.result.success = false;
        return Ok(runner.result);
      }
    }
  }

  for export in &config.exports {
    let Some((_, tree)) = trees.iter().find(|(name, _)| name == export) else {
      continue;
    };
    let path = match &config.output_dir {
      Some(dir) => export_to(dir, export, &tree.path()).await?,
      None => tree.path(),
    };
    info!(export = %export, path = %path.display(), "exported");
    runner.result.exports.insert(export.clone(), path);
  }

  runner.result.success = true;
  Ok(runner.result)
}

/// Check which ids are present in the store.
async fn cached_ids(store: &Store, ids: BTreeSet<ObjectId>, parallelism: usize) -> HashSet<ObjectId> {
  let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
  let mut join_set = JoinSet::new();

  for id in ids {
    let store = store.clone();
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let _permit = semaphore.acquire_owned().await.ok();
      let found = tokio::task::spawn_blocking({
        let id = id.clone();
        move || store.has(&id)
      })
      .await
      .unwrap_or(false);
      (id, found)
    });
  }

  let mut cached = HashSet::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((id, true)) => {
        cached.insert(id);
      }
      Ok((_, false)) => {}
      Err(e) => error!(error = %e, "store lookup task failed"),
    }
  }
  cached
}

/// Pipelines needed for `exports`, in the dependency order of `required`.
///
/// The walk back from the exports stops at cached pipelines, so their
/// dependencies are left out unless something else needs them.
fn depsolve<'a>(
  resolved: &'a ResolvedManifest,
  exports: &[String],
  required: &[String],
  cached: &HashSet<ObjectId>,
) -> Result<Vec<&'a ResolvedPipeline>, ExecuteError> {
  let mut needed: HashSet<String> = HashSet::new();
  let mut stack: Vec<String> = exports.to_vec();

  while let Some(name) = stack.pop() {
    if !needed.insert(name.clone()) {
      continue;
    }
    let pipeline = resolved
      .pipeline(&name)
      .ok_or_else(|| ExecuteError::UnknownExport(name.clone()))?;
    if cached.contains(&pipeline.id) {
      continue;
    }
    stack.extend(resolved.dag.dependencies(&name));
  }

  Ok(
    required
      .iter()
      .filter(|name| needed.contains(*name))
      .filter_map(|name| resolved.pipeline(name))
      .collect(),
  )
}

/// Source items used by pipelines that will be built.
fn referenced_sources(
  resolved: &ResolvedManifest,
  plan: &[&ResolvedPipeline],
  cached: &HashSet<ObjectId>,
) -> Vec<ResolvedSource> {
  let keys: HashSet<&str> = plan
    .iter()
    .filter(|p| !cached.contains(&p.id))
    .flat_map(|p| &p.steps)
    .flat_map(|s| &s.inputs)
    .filter(|i| i.origin == InputOrigin::Source)
    .flat_map(|i| &i.refs)
    .map(|r| r.reference.as_str())
    .collect();

  resolved
    .sources
    .iter()
    .filter_map(|source| {
      let mut source = source.clone();
      source.items.retain(|key, _| keys.contains(key.as_str()));
      (!source.items.is_empty()).then_some(source)
    })
    .collect()
}

async fn export_to(dir: &std::path::Path, name: &str, tree: &std::path::Path) -> Result<PathBuf, ExecuteError> {
  let dest = dir.join(name);
  let export_error = |source: std::io::Error| ExecuteError::Export {
    name: name.to_string(),
    path: dest.clone(),
    source,
  };

  if dest.exists() {
    remove_tree(&dest).map_err(export_error)?;
  }
  fs::create_dir_all(&dest).map_err(export_error)?;
  copy_tree(tree, &dest).await.map_err(export_error)?;
  Ok(dest)
}

/// The tree a pipeline produced.
enum Built {
  Committed(TreeHandle),
  Scratch(WriteHandle),
}

impl Built {
  fn path(&self) -> PathBuf {
    match self {
      Built::Committed(handle) => handle.tree(),
      Built::Scratch(handle) => handle.tree(),
    }
  }
}

struct Runner<'a> {
  store: &'a Store,
  config: &'a ExecuteConfig,
  resolved: &'a ResolvedManifest,
  sandbox: Sandbox,
  cached: HashSet<ObjectId>,
  planned: HashSet<String>,
  result: RunResult,
}

impl Runner<'_> {
  fn checkpointed(&self, name: &str, id: &ObjectId) -> bool {
    self
      .config
      .checkpoints
      .iter()
      .any(|c| pipeline_ref_name(c) == name || c == id.as_str())
  }

  /// Whether the finished tree of `pipeline` has to be kept in the store.
  fn must_commit(&self, pipeline: &ResolvedPipeline) -> bool {
    let exported = self.config.exports.contains(&pipeline.name);
    self.checkpointed(&pipeline.name, &pipeline.id)
      || (exported && self.config.output_dir.is_none())
      || self
        .resolved
        .dag
        .dependents(&pipeline.name)
        .iter()
        .any(|d| self.planned.contains(d))
  }

  /// Produce the tree of `pipeline`. `None` means a step failed; the
  /// failure is recorded in the result.
  async fn build(&mut self, pipeline: &ResolvedPipeline) -> Result<Option<Built>, ExecuteError> {
    let name = pipeline.name.as_str();

    if self.cached.contains(&pipeline.id)
      && let Some(tree) = self.store.read(&pipeline.id)?
    {
      info!(pipeline = name, id = %pipeline.id.short(), "pipeline cached");
      self.result.pipelines.insert(
        name.to_string(),
        PipelineResult {
          id: pipeline.id.clone(),
          success: true,
          cached: true,
          steps: pipeline.steps.iter().map(|s| StepResult::cached(&s.id, s.kind())).collect(),
        },
      );
      return Ok(Some(Built::Committed(tree)));
    }

    let build_root = match &pipeline.build {
      Some(build) => Some(self.store.read(&build.id)?.ok_or_else(|| ExecuteError::MissingTree {
        pipeline: build.name.clone(),
        id: build.id.clone(),
      })?),
      None => None,
    };
    let build_root_path = build_root.as_ref().map(TreeHandle::tree);

    // resume from the latest step already in the store
    let mut start = 0;
    let mut handle = None;
    for (i, step) in pipeline.steps.iter().enumerate().rev() {
      if self.cached.contains(&step.id)
        && let Some(base) = self.store.read(&step.id)?
      {
        debug!(pipeline = name, step = %step.id.short(), "resuming from cached step");
        handle = Some(self.store.stage_from(&base).await?);
        start = i + 1;
        break;
      }
    }
    let handle = match handle {
      Some(handle) => handle,
      None => self.store.stage_write()?,
    };

    info!(pipeline = name, id = %pipeline.id.short(), steps = pipeline.steps.len() - start, "building pipeline");
    let mut steps: Vec<StepResult> = pipeline.steps[..start]
      .iter()
      .map(|s| StepResult::cached(&s.id, s.kind()))
      .collect();
    let tree = handle.tree();

    for step in &pipeline.steps[start..] {
      if self.config.interrupted() {
        warn!(pipeline = name, "interrupted before step");
        return Err(ExecuteError::Interrupted);
      }

      let env = StepEnv {
        pipeline: name,
        tree: &tree,
        build_root: build_root_path.as_deref(),
        source_epoch: pipeline.source_epoch,
      };
      let outcome = self.sandbox.execute(step, &env).await?;
      let step_result = StepResult {
        id: step.id.clone(),
        kind: step.kind().to_string(),
        success: outcome.success,
        cached: false,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        metadata: outcome.metadata,
        duration_ms: outcome.duration.as_millis() as u64,
        error: outcome.error,
      };

      if !step_result.success {
        let message = step_result.error.clone().unwrap_or_else(|| "step failed".to_string());
        error!(pipeline = name, step = %step.id.short(), module = %step.kind(), error = %message, "step failed");
        let record = self.store.write_failure(
          &step.id,
          &FailureRecord {
            pipeline: name.to_string(),
            step: step_result.record(),
            error: message.clone(),
          },
        )?;
        steps.push(step_result);
        self.result.pipelines.insert(
          name.to_string(),
          PipelineResult {
            id: pipeline.id.clone(),
            success: false,
            cached: false,
            steps,
          },
        );
        self.result.failure = Some(RunFailure {
          pipeline: name.to_string(),
          step: step.id.clone(),
          error: message,
          record,
        });
        return Ok(None);
      }

      info!(pipeline = name, step = %step.id.short(), module = %step.kind(), duration_ms = step_result.duration_ms, "step finished");
      steps.push(step_result);

      if step.id != pipeline.id && self.config.checkpoints.iter().any(|c| c == step.id.as_str()) {
        let meta = ObjectMeta::new(step.id.clone(), Some(name.to_string()), records(&steps));
        self.store.commit_copy(&handle, &step.id, &meta).await?;
        debug!(pipeline = name, step = %step.id.short(), "checkpointed step");
      }
    }

    let built = if self.must_commit(pipeline) {
      let meta = ObjectMeta::new(pipeline.id.clone(), Some(name.to_string()), records(&steps));
      Built::Committed(self.store.commit(handle, &pipeline.id, &meta)?)
    } else {
      Built::Scratch(handle)
    };

    self.result.pipelines.insert(
      name.to_string(),
      PipelineResult {
        id: pipeline.id.clone(),
        success: true,
        cached: false,
        steps,
      },
    );
    Ok(Some(built))
  }
}

fn records(steps: &[StepResult]) -> Vec<crate::store::StepRecord> {
  steps.iter().filter(|s| !s.cached).map(StepResult::record).collect()
}
