//! treebuild: build operating system artifact trees from pipeline manifests.

mod cmd;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, GcArgs, InspectArgs, exit};
use crate::output::print_error;

#[derive(Parser)]
#[command(name = "treebuild")]
#[command(author, version, about = "Build operating system artifact trees from pipeline manifests", long_about = None)]
struct Cli {
  /// Enable debug logging (RUST_LOG takes precedence)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the exported pipelines of a manifest
  Build(BuildArgs),
  /// Resolve a manifest and show pipeline ids and dependencies
  Inspect(InspectArgs),
  /// Evict least-recently-used store entries down to a size budget
  Gc(GcArgs),
}

fn main() -> ExitCode {
  if !standard_streams_open() {
    return ExitCode::from(exit::NO_STDIO);
  }

  let cli = Cli::parse();
  init_logging(cli.verbose);

  let result = match cli.command {
    Commands::Build(args) => cmd::cmd_build(args),
    Commands::Inspect(args) => cmd::cmd_inspect(args),
    Commands::Gc(args) => cmd::cmd_gc(args),
  };

  match result {
    Ok(code) => code,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::from(exit::code_for(&err))
    }
  }
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

/// Modules inherit stdin/stdout/stderr descriptors, so a run refuses to start
/// when any of them is closed.
fn standard_streams_open() -> bool {
  use nix::fcntl::{FcntlArg, fcntl};

  [0, 1, 2].into_iter().all(|fd| fcntl(fd, FcntlArg::F_GETFD).is_ok())
}
