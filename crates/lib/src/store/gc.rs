//! Size-bounded garbage collection.
//!
//! Entries are evicted least-recently-used first until the store fits the
//! byte budget. Entries in the live set (the identifiers of the manifest
//! being built) are never evicted. Scratch trees abandoned by crashed runs
//! are removed as well; callers must hold the exclusive store lock so no
//! scratch tree is in use. A scratch tree with anything still mounted below
//! it (a run whose teardown failed) is skipped, never descended into.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Store, StoreError};
use crate::util::fs::{dir_size, mounts_below, remove_tree};
use crate::util::hash::ObjectId;

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub objects_scanned: usize,
  pub objects_deleted: usize,
  pub objects_bytes_freed: u64,
  pub scratch_deleted: usize,
  pub scratch_bytes_freed: u64,
  /// Scratch trees left alone because a filesystem is still mounted below them.
  pub scratch_skipped: usize,
  /// Size of all objects before collection.
  pub size_before: u64,
  /// Size of all objects after collection.
  pub size_after: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.objects_deleted + self.scratch_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.objects_bytes_freed + self.scratch_bytes_freed
  }
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

impl Store {
  /// Evict entries until the store holds at most `max_size` bytes of objects.
  pub fn gc(&self, max_size: u64, live: &BTreeSet<ObjectId>, dry_run: bool) -> Result<GcResult, StoreError> {
    let mut stats = GcStats::default();
    let mut deleted_paths = Vec::new();

    self.sweep_scratch(dry_run, &mut stats, &mut deleted_paths)?;

    let mut entries: Vec<_> = self.entries()?.into_values().collect();
    stats.objects_scanned = entries.len();
    stats.size_before = entries.iter().map(|e| e.size).sum();
    let mut total = stats.size_before;

    // oldest first; id breaks ties so eviction order is stable
    entries.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.id.cmp(&b.id)));

    for entry in entries {
      if total <= max_size {
        break;
      }
      if live.contains(&entry.id) {
        debug!(id = %entry.id, "keeping live object");
        continue;
      }

      debug!(id = %entry.id, size = entry.size, "evicting object");
      if !dry_run
        && let Err(e) = evict(&entry.path)
      {
        warn!(path = %entry.path.display(), error = %e, "failed to evict object");
        continue;
      }
      total -= entry.size;
      stats.objects_deleted += 1;
      stats.objects_bytes_freed += entry.size;
      deleted_paths.push(entry.path);
    }

    stats.size_after = total;

    info!(
      objects_deleted = stats.objects_deleted,
      scratch_deleted = stats.scratch_deleted,
      bytes_freed = stats.total_bytes_freed(),
      size_after = stats.size_after,
      max_size,
      dry_run,
      "garbage collection complete"
    );

    Ok(GcResult { stats, deleted_paths })
  }

  fn sweep_scratch(
    &self,
    dry_run: bool,
    stats: &mut GcStats,
    deleted_paths: &mut Vec<PathBuf>,
  ) -> Result<(), StoreError> {
    let tmp = self.tmp_dir();
    for entry in fs::read_dir(&tmp).map_err(|e| StoreError::io(&tmp, e))?.flatten() {
      let path = entry.path();
      match mounts_below(&path) {
        Ok(mounts) if mounts.is_empty() => {}
        Ok(mounts) => {
          warn!(
            path = %path.display(),
            mount = %mounts[0].display(),
            "scratch tree still has a filesystem attached, skipping"
          );
          stats.scratch_skipped += 1;
          continue;
        }
        Err(e) => {
          warn!(path = %path.display(), error = %e, "cannot check scratch tree for mounts, skipping");
          stats.scratch_skipped += 1;
          continue;
        }
      }

      let size = dir_size(&path);
      debug!(path = %path.display(), "removing abandoned scratch tree");

      if !dry_run
        && let Err(e) = remove_tree(&path)
      {
        warn!(path = %path.display(), error = %e, "failed to remove scratch tree");
        continue;
      }
      stats.scratch_deleted += 1;
      stats.scratch_bytes_freed += size;
      deleted_paths.push(path);
    }
    Ok(())
  }
}

/// Remove an object directory, dropping `meta.json` first so an eviction cut
/// short leaves a miss rather than a truncated hit.
fn evict(path: &Path) -> io::Result<()> {
  match fs::remove_file(path.join("meta.json")) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => return Err(e),
  }
  remove_tree(path)
}
