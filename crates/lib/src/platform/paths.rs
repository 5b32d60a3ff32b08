//! Default locations for the store and the module library.
//!
//! Every location can be overridden by an environment variable, and callers
//! (the CLI) may override both again with explicit flags.

use std::path::PathBuf;

use crate::consts::{DEFAULT_LIBDIR, DEFAULT_STORE_DIR, LIBDIR_ENV, STORE_ENV};

/// Returns the store directory: `$TREEBUILD_STORE`, or `.treebuild` in the working directory.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var(STORE_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  PathBuf::from(DEFAULT_STORE_DIR)
}

/// Returns the module library directory: `$TREEBUILD_LIBDIR`, or `/usr/lib/treebuild`.
pub fn libdir() -> PathBuf {
  if let Ok(path) = std::env::var(LIBDIR_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  PathBuf::from(DEFAULT_LIBDIR)
}
