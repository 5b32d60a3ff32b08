//! Content-addressable store.
//!
//! Trees are stored under the identifier of the definition that produced
//! them. An identifier always maps to the same content, so entries are never
//! invalidated, only evicted.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── .lock                   # cross-process lock (see store_lock)
//! ├── store.json              # store-level settings (max_size)
//! ├── objects/
//! │   └── <id>/
//! │       ├── tree/           # the filesystem tree
//! │       └── meta.json       # ObjectMeta
//! ├── tmp/                    # scratch trees being written
//! ├── sources/
//! │   └── <content-type>/     # fetched source items, e.g. files/<checksum>
//! └── failures/
//!     └── <id>.json           # FailureRecord of the last failed attempt
//! ```
//!
//! # Commit protocol
//!
//! A scratch tree lives in its own directory below `tmp/`. Committing writes
//! `meta.json` next to the tree and renames the whole directory to
//! `objects/<id>`. `rename(2)` onto a non-empty directory fails, so exactly
//! one committer wins; a loser discards its copy and returns the winner's
//! handle. An entry counts as present only once its `meta.json` exists, and
//! eviction removes `meta.json` first, so a half-removed directory reads as
//! a miss and is replaced by the next commit.

pub mod gc;
mod types;

pub use types::*;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::util::fs::{atomic_write, copy_tree, dir_size, remove_tree};
use crate::util::hash::ObjectId;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const SOURCES_DIR: &str = "sources";
const FAILURES_DIR: &str = "failures";
const CONFIG_FILE: &str = "store.json";

/// An exclusively-owned scratch tree that becomes the write target of one
/// or more steps. Dropping it without committing removes it.
#[derive(Debug)]
pub struct WriteHandle {
  dir: TempDir,
}

impl WriteHandle {
  pub fn tree(&self) -> PathBuf {
    self.dir.path().join("tree")
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

#[derive(Debug, Clone)]
pub struct Store {
  root: PathBuf,
}

impl Store {
  /// Open (creating if needed) the store at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    for dir in [OBJECTS_DIR, TMP_DIR, SOURCES_DIR, FAILURES_DIR] {
      let path = root.join(dir);
      fs::create_dir_all(&path).map_err(|source| StoreError::Create { path, source })?;
    }
    let root = dunce::canonicalize(&root).map_err(|e| StoreError::io(&root, e))?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn object_dir(&self, id: &ObjectId) -> PathBuf {
    self.root.join(OBJECTS_DIR).join(id.as_str())
  }

  /// Whether a complete entry exists for `id`.
  pub fn has(&self, id: &ObjectId) -> bool {
    self.object_dir(id).join("meta.json").is_file()
  }

  /// Look up an entry. A missing entry is `Ok(None)`: the caller must build it.
  ///
  /// A hit refreshes the entry's access time for LRU eviction.
  pub fn read(&self, id: &ObjectId) -> Result<Option<TreeHandle>, StoreError> {
    if !self.has(id) {
      return Ok(None);
    }
    let root = self.object_dir(id);
    if let Err(e) = filetime::set_file_mtime(&root, FileTime::now()) {
      debug!(id = %id, error = %e, "failed to refresh access time");
    }
    Ok(Some(TreeHandle { id: id.clone(), root }))
  }

  /// A private directory below `tmp/`, removed when dropped.
  pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir, StoreError> {
    let tmp = self.tmp_dir();
    tempfile::Builder::new()
      .prefix(prefix)
      .tempdir_in(&tmp)
      .map_err(|e| StoreError::io(&tmp, e))
  }

  /// Create an empty scratch tree.
  pub fn stage_write(&self) -> Result<WriteHandle, StoreError> {
    let handle = WriteHandle {
      dir: self.scratch_dir("stage-")?,
    };
    let tree = handle.tree();
    fs::create_dir(&tree).map_err(|e| StoreError::io(&tree, e))?;
    Ok(handle)
  }

  /// Create a scratch tree seeded with a copy of a committed tree.
  pub async fn stage_from(&self, base: &TreeHandle) -> Result<WriteHandle, StoreError> {
    let handle = self.stage_write()?;
    copy_tree(&base.tree(), &handle.tree())
      .await
      .map_err(|e| StoreError::io(&base.tree(), e))?;
    Ok(handle)
  }

  /// Publish a scratch tree under `id`.
  ///
  /// If another writer already committed `id`, the scratch copy is discarded
  /// and the existing entry is returned.
  pub fn commit(&self, handle: WriteHandle, id: &ObjectId, meta: &ObjectMeta) -> Result<TreeHandle, StoreError> {
    let target = self.object_dir(id);
    if self.has(id) {
      debug!(id = %id, "object already present, discarding scratch tree");
      return Ok(TreeHandle { id: id.clone(), root: target });
    }
    if target.exists() {
      // no meta.json: left over from an interrupted eviction
      warn!(id = %id, "replacing incomplete object");
      remove_tree(&target).map_err(|source| StoreError::Commit { id: id.clone(), source })?;
    }

    let meta_path = handle.path().join("meta.json");
    let content = serde_json::to_vec_pretty(meta).map_err(|e| StoreError::Metadata {
      path: meta_path.clone(),
      message: e.to_string(),
    })?;
    atomic_write(&meta_path, &content).map_err(|e| StoreError::io(&meta_path, e))?;

    let staged = handle.dir.keep();
    match fs::rename(&staged, &target) {
      Ok(()) => {
        info!(id = %id, "committed object");
        Ok(TreeHandle { id: id.clone(), root: target })
      }
      Err(e) if matches!(e.kind(), io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists) => {
        if let Err(e) = remove_tree(&staged) {
          warn!(path = %staged.display(), error = %e, "failed to remove discarded scratch tree");
        }
        if !self.has(id) {
          return Err(StoreError::Commit { id: id.clone(), source: e });
        }
        debug!(id = %id, "lost commit race, reusing winner");
        Ok(TreeHandle { id: id.clone(), root: target })
      }
      Err(source) => {
        let _ = remove_tree(&staged);
        Err(StoreError::Commit { id: id.clone(), source })
      }
    }
  }

  /// Commit a copy of a scratch tree that is still in use.
  ///
  /// Used for checkpoints in the middle of a pipeline: later steps keep
  /// writing to `handle` while the snapshot is published under `id`.
  pub async fn commit_copy(
    &self,
    handle: &WriteHandle,
    id: &ObjectId,
    meta: &ObjectMeta,
  ) -> Result<TreeHandle, StoreError> {
    if let Some(existing) = self.read(id)? {
      return Ok(existing);
    }
    let copy = self.stage_write()?;
    copy_tree(&handle.tree(), &copy.tree())
      .await
      .map_err(|e| StoreError::io(&handle.tree(), e))?;
    self.commit(copy, id, meta)
  }

  /// Directory holding source items of a content type.
  pub fn source_cache(&self, content_type: &str) -> Result<PathBuf, StoreError> {
    let path = self.root.join(SOURCES_DIR).join(content_type);
    fs::create_dir_all(&path).map_err(|source| StoreError::Create {
      path: path.clone(),
      source,
    })?;
    Ok(path)
  }

  /// Record why building `id` failed, replacing any earlier record.
  pub fn write_failure(&self, id: &ObjectId, record: &FailureRecord) -> Result<PathBuf, StoreError> {
    let path = self.root.join(FAILURES_DIR).join(format!("{id}.json"));
    let content = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Metadata {
      path: path.clone(),
      message: e.to_string(),
    })?;
    atomic_write(&path, &content).map_err(|e| StoreError::io(&path, e))?;
    Ok(path)
  }

  pub fn read_failure(&self, id: &ObjectId) -> Result<Option<FailureRecord>, StoreError> {
    let path = self.root.join(FAILURES_DIR).join(format!("{id}.json"));
    match fs::read(&path) {
      Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| StoreError::Metadata {
        path,
        message: e.to_string(),
      }),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(StoreError::io(&path, e)),
    }
  }

  /// Load `store.json`, defaulting when absent.
  pub fn config(&self) -> Result<StoreConfig, StoreError> {
    let path = self.root.join(CONFIG_FILE);
    match fs::read(&path) {
      Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Metadata {
        path,
        message: e.to_string(),
      }),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreConfig::default()),
      Err(e) => Err(StoreError::io(&path, e)),
    }
  }

  pub fn save_config(&self, config: &StoreConfig) -> Result<(), StoreError> {
    let path = self.root.join(CONFIG_FILE);
    let content = serde_json::to_vec_pretty(config).map_err(|e| StoreError::Metadata {
      path: path.clone(),
      message: e.to_string(),
    })?;
    atomic_write(&path, &content).map_err(|e| StoreError::io(&path, e))
  }

  /// All committed entries, keyed by id.
  pub fn entries(&self) -> Result<BTreeMap<ObjectId, StoreEntry>, StoreError> {
    let objects = self.root.join(OBJECTS_DIR);
    let mut entries = BTreeMap::new();

    for entry in fs::read_dir(&objects).map_err(|e| StoreError::io(&objects, e))?.flatten() {
      let path = entry.path();
      let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(ObjectId::parse) else {
        continue;
      };
      let Ok(metadata) = fs::metadata(&path) else {
        continue;
      };
      entries.insert(
        id.clone(),
        StoreEntry {
          id,
          size: dir_size(&path),
          last_used: FileTime::from_last_modification_time(&metadata).unix_seconds(),
          path,
        },
      );
    }

    Ok(entries)
  }

  fn tmp_dir(&self) -> PathBuf {
    self.root.join(TMP_DIR)
  }
}
