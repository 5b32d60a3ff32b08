//! Implementation of the `treebuild gc` command.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;

use treebuild_lib::platform::paths;
use treebuild_lib::store::Store;
use treebuild_lib::store_lock::{LockMode, StoreLock};

use super::{UsageError, exit};
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success, print_warning,
};

#[derive(Debug, Args)]
pub struct GcArgs {
  /// Store directory (default: $TREEBUILD_STORE or ./.treebuild)
  #[arg(long)]
  pub store: Option<PathBuf>,

  /// Byte budget for committed trees (default: max_size from store.json)
  #[arg(long = "max-size", value_name = "BYTES")]
  pub max_size: Option<u64>,

  /// Report what would be removed without removing it
  #[arg(long)]
  pub dry_run: bool,

  /// Print the result as JSON
  #[arg(long)]
  pub json: bool,
}

pub fn cmd_gc(args: GcArgs) -> Result<ExitCode> {
  let output = OutputFormat::from_json_flag(args.json);
  let start = Instant::now();
  let root = args.store.unwrap_or_else(paths::store_dir);

  let _lock = StoreLock::acquire(&root, LockMode::Exclusive, "gc").context("Failed to acquire store lock")?;
  let store = Store::open(&root)?;

  let max_size = match args.max_size {
    Some(size) => size,
    None => store
      .config()?
      .max_size
      .ok_or_else(|| UsageError("no --max-size given and the store has no configured max_size".to_string()))?,
  };

  let result = store.gc(max_size, &BTreeSet::new(), args.dry_run)?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if args.dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Objects removed", &result.stats.objects_deleted.to_string());
    print_stat("Scratch trees removed", &result.stats.scratch_deleted.to_string());
    if result.stats.scratch_skipped > 0 {
      print_warning(&format!(
        "{} scratch tree(s) still have a filesystem mounted and were kept",
        result.stats.scratch_skipped
      ));
    }
    print_stat("Store size", &format_bytes(result.stats.size_after));
    print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(ExitCode::from(exit::SUCCESS))
}
