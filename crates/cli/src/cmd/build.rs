//! Implementation of the `treebuild build` command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tracing::{info, warn};

use treebuild_lib::execute::report::{error_document, result_document};
use treebuild_lib::execute::{ExecuteConfig, ExecuteError, RunResult, run};
use treebuild_lib::manifest::{Manifest, PipelineDesc};
use treebuild_lib::modules::ModuleRegistry;
use treebuild_lib::platform::paths;
use treebuild_lib::resolve::resolve;
use treebuild_lib::sandbox::SandboxMode;
use treebuild_lib::store::Store;
use treebuild_lib::store_lock::{LockMode, StoreLock};

use super::{exit, load_manifest, read_json_file};
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_captured, print_error, print_info, print_json, print_stat,
  print_step, print_success, print_warning, symbols, truncate_hash,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// Manifest file, or `-` to read it from standard input
  pub manifest: PathBuf,

  /// Store directory (default: $TREEBUILD_STORE or ./.treebuild)
  #[arg(long)]
  pub store: Option<PathBuf>,

  /// Module library directory (default: $TREEBUILD_LIBDIR or /usr/lib/treebuild)
  #[arg(long)]
  pub libdir: Option<PathBuf>,

  /// Pipeline to build and export; may be repeated
  #[arg(long = "export", value_name = "PIPELINE")]
  pub exports: Vec<String>,

  /// Pipeline name or step id to keep in the store; may be repeated
  #[arg(long = "checkpoint", value_name = "NAME|ID")]
  pub checkpoints: Vec<String>,

  /// Copy exports to <DIR>/<pipeline> instead of returning store paths
  #[arg(long = "output-directory", value_name = "DIR")]
  pub output_dir: Option<PathBuf>,

  /// JSON object of per-source-type secrets passed to external sources
  #[arg(long, value_name = "FILE")]
  pub secrets: Option<PathBuf>,

  /// JSON pipeline used as the build root of pipelines without one
  #[arg(long = "build-env", value_name = "FILE")]
  pub build_env: Option<PathBuf>,

  /// Step isolation: auto, isolated or host
  #[arg(long, default_value = "auto")]
  pub sandbox: SandboxMode,

  /// Kill a step that runs longer than this (e.g. "30m")
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Maximum number of concurrent fetches and store lookups
  #[arg(short = 'j', long)]
  pub jobs: Option<usize>,

  /// Record a byte budget for the store and collect garbage after the build
  #[arg(long = "cache-max-size", value_name = "BYTES")]
  pub cache_max_size: Option<u64>,

  /// Print the result document as JSON
  #[arg(long)]
  pub json: bool,
}

/// Execute the build command.
///
/// Returns the process exit code: a failed step is a normal outcome that is
/// reported, not an error.
pub fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
  let output = OutputFormat::from_json_flag(args.json);
  let start = Instant::now();

  let manifest = load_manifest(&args.manifest)?;
  let secrets: BTreeMap<String, Value> = match &args.secrets {
    Some(path) => read_json_file("--secrets", path)?,
    None => BTreeMap::new(),
  };
  let build_env: Option<PipelineDesc> = match &args.build_env {
    Some(path) => Some(read_json_file("--build-env", path)?),
    None => None,
  };

  let mut config = ExecuteConfig {
    store: args.store.unwrap_or_else(paths::store_dir),
    libdir: args.libdir.unwrap_or_else(paths::libdir),
    sandbox: args.sandbox,
    step_timeout: args.timeout,
    output_dir: args.output_dir,
    checkpoints: args.checkpoints,
    exports: args.exports,
    secrets,
    build_env,
    ..ExecuteConfig::default()
  };
  if let Some(jobs) = args.jobs {
    config.parallelism = jobs.max(1);
  }
  if config.exports.is_empty() {
    warn!("no --export given, nothing will be built");
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(async {
    let interrupt = config.interrupt.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, stopping after the running step");
        interrupt.store(true, Ordering::SeqCst);
      }
    });
    run(manifest.clone(), &config).await
  });
  // the signal task must not outlive the run
  rt.shutdown_background();

  let result = match outcome {
    Ok(result) => result,
    Err(err) => {
      report_error(&err, output)?;
      return Ok(ExitCode::from(exit::for_execute(&err)));
    }
  };

  if output.is_json() {
    print_json(&result_document(&result))?;
  } else {
    print_summary(&result, start.elapsed());
  }

  if !result.success {
    return Ok(ExitCode::from(exit::FAILURE));
  }

  if let Err(e) = collect_after_build(&config, manifest, args.cache_max_size, output) {
    print_warning(&format!("garbage collection skipped: {e:#}"));
  }
  Ok(ExitCode::from(exit::SUCCESS))
}

fn report_error(err: &ExecuteError, output: OutputFormat) -> Result<()> {
  if output.is_json() {
    return print_json(&error_document(err));
  }
  print_error(&err.to_string());
  Ok(())
}

fn print_summary(result: &RunResult, elapsed: Duration) {
  for (name, pipeline) in &result.pipelines {
    let state = if pipeline.cached { " (cached)" } else { "" };
    print_info(&format!("{name} {}{state}", truncate_hash(pipeline.id.as_str())));
    for step in &pipeline.steps {
      print_step(
        step.id.as_str(),
        &step.kind,
        step.cached,
        step.success,
        Duration::from_millis(step.duration_ms),
      );
    }
  }

  println!();
  if let Some(failure) = &result.failure {
    print_error(&format!(
      "Pipeline '{}' failed at step {}: {}",
      failure.pipeline,
      truncate_hash(failure.step.as_str()),
      failure.error
    ));
    let step = result
      .pipelines
      .get(&failure.pipeline)
      .and_then(|p| p.steps.iter().find(|s| s.id == failure.step));
    if let Some(step) = step {
      print_captured("stdout", &step.stdout);
      print_captured("stderr", &step.stderr);
    }
    eprintln!("  failure record: {}", failure.record.display());
    return;
  }

  print_success("Build complete!");
  for (name, path) in &result.exports {
    print_stat(name, &format!("{} {}", symbols::ARROW, path.display()));
  }
  print_stat("Steps run", &result.executed_steps().to_string());
  print_stat("Duration", &format_duration(elapsed));
}

/// Enforce the store byte budget once the run has released its shared lock.
fn collect_after_build(
  config: &ExecuteConfig,
  manifest: Manifest,
  cache_max_size: Option<u64>,
  output: OutputFormat,
) -> Result<()> {
  let store = Store::open(&config.store)?;
  let mut store_config = store.config()?;
  if let Some(max_size) = cache_max_size {
    store_config.max_size = Some(max_size);
    store.save_config(&store_config)?;
  }
  let Some(max_size) = store_config.max_size else {
    return Ok(());
  };

  let _lock = StoreLock::acquire(&config.store, LockMode::Exclusive, "build")?;

  // everything the manifest can reference stays, whether or not it was needed
  let manifest = match &config.build_env {
    Some(env) => manifest.with_build_env(env.clone())?,
    None => manifest,
  };
  let live = resolve(&manifest, &ModuleRegistry::new(&config.libdir))?.all_ids();

  let result = store.gc(max_size, &live, false)?;
  info!(
    deleted = result.stats.total_deleted(),
    freed = result.stats.total_bytes_freed(),
    "store trimmed"
  );
  if !output.is_json() && result.stats.total_deleted() > 0 {
    print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
  }
  Ok(())
}
