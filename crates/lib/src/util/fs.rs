//! Filesystem helpers shared by the store, sources and the sandbox.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use walkdir::WalkDir;

/// Total size in bytes of all regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Write `data` to `path` via a sibling temp file and rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
  let file_name = path
    .file_name()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
  let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
  fs::write(&temp_path, data)?;
  fs::rename(&temp_path, path)
}

/// Copy the contents of `src` into the existing directory `dst`.
///
/// Uses `cp -a` so ownership, modes, timestamps, xattrs and hard links
/// survive, with reflinks where the filesystem supports them.
pub async fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
  let output = Command::new("cp")
    .arg("-a")
    .arg("--reflink=auto")
    .arg("--")
    .arg(src.join("."))
    .arg(dst)
    .env_clear()
    .env("PATH", "/usr/bin:/bin")
    .env("LC_ALL", "C")
    .output()
    .await?;

  if output.status.success() {
    Ok(())
  } else {
    Err(io::Error::other(format!(
      "copying {} to {} failed: {}",
      src.display(),
      dst.display(),
      String::from_utf8_lossy(&output.stderr).trim()
    )))
  }
}

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount points at or below `path`.
///
/// A missing `path` has none.
pub fn mounts_below(path: &Path) -> io::Result<Vec<PathBuf>> {
  let root = match dunce::canonicalize(path) {
    Ok(root) => root,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e),
  };
  let mountinfo = match fs::read_to_string(MOUNTINFO) {
    Ok(text) => text,
    // no procfs, nothing to compare against
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e),
  };
  Ok(
    parse_mount_points(&mountinfo)
      .into_iter()
      .filter(|mount| mount.starts_with(&root))
      .collect(),
  )
}

/// The mount point column (the fifth field) of each `mountinfo` line.
fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
  mountinfo
    .lines()
    .filter_map(|line| line.split(' ').nth(4))
    .map(unescape_mount_field)
    .collect()
}

/// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_field(field: &str) -> PathBuf {
  let bytes = field.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'\\'
      && let Some(code) = field
        .get(i + 1..i + 4)
        .filter(|oct| oct.bytes().all(|b| (b'0'..=b'7').contains(&b)))
        .and_then(|oct| u8::from_str_radix(oct, 8).ok())
    {
      out.push(code);
      i += 4;
      continue;
    }
    out.push(bytes[i]);
    i += 1;
  }
  PathBuf::from(OsStr::from_bytes(&out))
}

/// Remove a tree that may contain read-only directories left behind by steps.
///
/// Refuses with `ResourceBusy` while anything is mounted below `path`, since
/// removal would descend into the mounted filesystem.
pub fn remove_tree(path: &Path) -> io::Result<()> {
  let mounted = mounts_below(path)?;
  if let Some(first) = mounted.first() {
    return Err(io::Error::new(
      io::ErrorKind::ResourceBusy,
      format!("{} is still mounted", first.display()),
    ));
  }

  match fs::remove_dir_all(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(first) => {
      make_dirs_writable(path);
      fs::remove_dir_all(path).map_err(|_| first)
    }
  }
}

#[cfg(unix)]
fn make_dirs_writable(path: &Path) {
  use std::os::unix::fs::PermissionsExt;

  for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
    if entry.file_type().is_dir()
      && let Ok(meta) = entry.metadata()
    {
      let mut perms = meta.permissions();
      perms.set_mode(perms.mode() | 0o700);
      let _ = fs::set_permissions(entry.path(), perms);
    }
  }
}

#[cfg(not(unix))]
fn make_dirs_writable(_path: &Path) {}
