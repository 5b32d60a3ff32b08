//! Cross-process arbitration of one store.
//!
//! A `flock(2)` on `<store>/.lock` decides who may touch the store:
//!
//! | holder | mode      | compatible with  |
//! |--------|-----------|------------------|
//! | build  | shared    | other builds     |
//! | gc     | exclusive | nothing          |
//!
//! Racing builds never corrupt each other; that is the commit protocol's job
//! (see [`crate::store`]). The lock only keeps garbage collection away from
//! trees and scratch directories a build is using. The exclusive holder
//! records itself in the lock file so a blocked process can say who it is
//! waiting for. Locks are never waited on: a busy store is an error.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

impl LockMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      LockMode::Shared => "shared",
      LockMode::Exclusive => "exclusive",
    }
  }

  fn operation(self) -> FlockOperation {
    match self {
      LockMode::Shared => FlockOperation::NonBlockingLockShared,
      LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    }
  }
}

/// The process holding a store exclusively, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  /// Seconds since the epoch when the lock was taken.
  pub since: u64,
}

impl LockHolder {
  fn current(command: &str) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      since: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default(),
    }
  }
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "'{}' (pid {}, since unix time {})", self.command, self.pid, self.since)
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("store {store} is busy: {wanted} lock refused, held by {holder}\nremove {lock_path} if that process is gone")]
  Busy {
    store: PathBuf,
    wanted: &'static str,
    holder: LockHolder,
    lock_path: PathBuf,
  },

  #[error("store {store} is busy: {wanted} lock refused\nremove {lock_path} if no treebuild process is running")]
  BusyUnknown {
    store: PathBuf,
    wanted: &'static str,
    lock_path: PathBuf,
  },

  #[error("cannot lock store at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A held store lock; released when dropped.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Take the lock on the store at `store`, creating the directory if needed.
  ///
  /// Fails immediately with [`StoreLockError::Busy`] when an incompatible
  /// lock is held.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let path = store.join(LOCK_FILE);
    let error_path = path.clone();
    let io_error = |source: io::Error| StoreLockError::Io {
      path: error_path.clone(),
      source,
    };

    std::fs::create_dir_all(store).map_err(io_error)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_error)?;

    match flock(file.as_fd(), mode.operation()) {
      Ok(()) => {}
      Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
        let wanted = mode.as_str();
        return Err(match read_holder(&path) {
          Some(holder) => StoreLockError::Busy {
            store: store.to_path_buf(),
            wanted,
            holder,
            lock_path: path,
          },
          None => StoreLockError::BusyUnknown {
            store: store.to_path_buf(),
            wanted,
            lock_path: path,
          },
        });
      }
      Err(e) => return Err(io_error(e.into())),
    }

    let mut lock = StoreLock { file, path, mode };
    if mode == LockMode::Exclusive {
      lock.record(&LockHolder::current(command)).map_err(io_error)?;
    }
    debug!(store = %store.display(), mode = mode.as_str(), command, "store locked");
    Ok(lock)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn lock_path(&self) -> &Path {
    &self.path
  }

  /// The holder recorded in the lock file, if any.
  pub fn holder(&self) -> Option<LockHolder> {
    let mut file = &self.file;
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
  }

  fn record(&mut self, holder: &LockHolder) -> io::Result<()> {
    let bytes = serde_json::to_vec(holder).map_err(io::Error::other)?;
    self.file.set_len(0)?;
    self.file.seek(SeekFrom::Start(0))?;
    self.file.write_all(&bytes)?;
    self.file.flush()
  }
}

/// Best-effort read of the recorded holder of a lock we could not take.
fn read_holder(path: &Path) -> Option<LockHolder> {
  let bytes = std::fs::read(path).ok()?;
  serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn builds_share_the_store() {
    let temp = TempDir::new().unwrap();
    let first = StoreLock::acquire(temp.path(), LockMode::Shared, "build").unwrap();
    let second = StoreLock::acquire(temp.path(), LockMode::Shared, "build").unwrap();
    assert_eq!(first.lock_path(), second.lock_path());
    assert_eq!(first.mode(), LockMode::Shared);
  }

  #[test]
  fn gc_is_refused_while_a_build_runs() {
    let temp = TempDir::new().unwrap();
    let _build = StoreLock::acquire(temp.path(), LockMode::Shared, "build").unwrap();

    let err = StoreLock::acquire(temp.path(), LockMode::Exclusive, "gc").unwrap_err();
    match err {
      StoreLockError::BusyUnknown { wanted, .. } => assert_eq!(wanted, "exclusive"),
      other => panic!("expected busy store, got {other}"),
    }
  }

  #[test]
  fn build_is_refused_during_gc_and_names_the_holder() {
    let temp = TempDir::new().unwrap();
    let gc = StoreLock::acquire(temp.path(), LockMode::Exclusive, "gc").unwrap();
    assert_eq!(gc.holder().unwrap().command, "gc");

    let err = StoreLock::acquire(temp.path(), LockMode::Shared, "build").unwrap_err();
    match &err {
      StoreLockError::Busy { holder, lock_path, .. } => {
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(lock_path, &temp.path().join(LOCK_FILE));
      }
      other => panic!("expected busy store, got {other}"),
    }
    assert!(err.to_string().contains("'gc'"));
  }

  #[test]
  fn missing_store_is_created() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("a/b/store");
    StoreLock::acquire(&store, LockMode::Shared, "build").unwrap();
    assert!(store.join(LOCK_FILE).is_file());
  }

  #[test]
  fn unusable_store_path_names_the_lock_file() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("store");
    std::fs::write(&store, "not a directory").unwrap();

    match StoreLock::acquire(&store, LockMode::Shared, "build").unwrap_err() {
      StoreLockError::Io { path, .. } => assert_eq!(path, store.join(LOCK_FILE)),
      other => panic!("expected io error, got {other}"),
    }
  }

  #[test]
  fn dropping_releases() {
    let temp = TempDir::new().unwrap();
    drop(StoreLock::acquire(temp.path(), LockMode::Exclusive, "gc").unwrap());
    StoreLock::acquire(temp.path(), LockMode::Exclusive, "gc again").unwrap();
  }
}
