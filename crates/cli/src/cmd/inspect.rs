//! Implementation of the `treebuild inspect` command.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use treebuild_lib::manifest::PipelineDesc;
use treebuild_lib::modules::ModuleRegistry;
use treebuild_lib::platform::paths;
use treebuild_lib::resolve::{ResolvedManifest, resolve};
use treebuild_lib::store::Store;

use super::{exit, load_manifest, read_json_file};
use crate::output::{OutputFormat, print_info, print_json, print_stat, truncate_hash};

#[derive(Debug, Args)]
pub struct InspectArgs {
  /// Manifest file, or `-` to read it from standard input
  pub manifest: PathBuf,

  /// Module library directory (default: $TREEBUILD_LIBDIR or /usr/lib/treebuild)
  #[arg(long)]
  pub libdir: Option<PathBuf>,

  /// JSON pipeline used as the build root of pipelines without one
  #[arg(long = "build-env", value_name = "FILE")]
  pub build_env: Option<PathBuf>,

  /// Report which pipelines and steps this store already holds
  #[arg(long)]
  pub store: Option<PathBuf>,

  /// Print the inspection as JSON
  #[arg(long)]
  pub json: bool,
}

#[derive(Debug, Serialize)]
struct Inspection {
  pipelines: Vec<PipelineView>,
  /// Pipelines grouped by dependency depth; each group only needs earlier ones.
  order: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct PipelineView {
  name: String,
  id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  build: Option<String>,
  dependencies: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  cached: Option<bool>,
  steps: Vec<StepView>,
}

#[derive(Debug, Serialize)]
struct StepView {
  id: String,
  #[serde(rename = "type")]
  kind: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  cached: Option<bool>,
}

/// Resolve a manifest without building anything.
pub fn cmd_inspect(args: InspectArgs) -> Result<ExitCode> {
  let output = OutputFormat::from_json_flag(args.json);

  let mut manifest = load_manifest(&args.manifest)?;
  if let Some(path) = &args.build_env {
    let env: PipelineDesc = read_json_file("--build-env", path)?;
    manifest = manifest.with_build_env(env)?;
  }

  let libdir = args.libdir.unwrap_or_else(paths::libdir);
  let resolved = resolve(&manifest, &ModuleRegistry::new(libdir))?;
  let store = args.store.map(Store::open).transpose()?;
  let inspection = inspect(&resolved, store.as_ref());

  if output.is_json() {
    print_json(&inspection)?;
  } else {
    print_inspection(&inspection);
  }
  Ok(ExitCode::from(exit::SUCCESS))
}

fn inspect(resolved: &ResolvedManifest, store: Option<&Store>) -> Inspection {
  let cached = |id: &treebuild_lib::util::hash::ObjectId| store.map(|s| s.has(id));

  let pipelines = resolved
    .pipelines
    .iter()
    .map(|p| PipelineView {
      name: p.name.clone(),
      id: p.id.to_string(),
      build: p.build.as_ref().map(|b| b.name.clone()),
      dependencies: p.dependencies().into_iter().map(str::to_string).collect(),
      cached: cached(&p.id),
      steps: p
        .steps
        .iter()
        .map(|s| StepView {
          id: s.id.to_string(),
          kind: s.kind().to_string(),
          cached: cached(&s.id),
        })
        .collect(),
    })
    .collect();

  Inspection {
    pipelines,
    order: resolved.dag.waves(),
  }
}

fn print_inspection(inspection: &Inspection) {
  for pipeline in &inspection.pipelines {
    let state = match pipeline.cached {
      Some(true) => " (cached)",
      _ => "",
    };
    print_info(&format!("{} {}{state}", pipeline.name, pipeline.id));
    if let Some(build) = &pipeline.build {
      print_stat("build", build);
    }
    if !pipeline.dependencies.is_empty() {
      print_stat("depends on", &pipeline.dependencies.join(", "));
    }
    for step in &pipeline.steps {
      let state = if step.cached == Some(true) { " (cached)" } else { "" };
      println!("    {} {}{state}", truncate_hash(&step.id), step.kind);
    }
  }

  println!();
  for (depth, wave) in inspection.order.iter().enumerate() {
    print_stat(&format!("wave {depth}"), &wave.join(", "));
  }
}
