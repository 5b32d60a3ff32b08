//! Namespace and chroot setup for isolated steps.
//!
//! An [`IsolationPlan`] is assembled in the engine, lowered to raw syscalls
//! by [`IsolationPlan::prepare`] and applied in the step process between
//! fork and exec. The new root is a tmpfs holding read-only
//! binds of the build root's system directories, fresh `/dev`, `/tmp`, `/var`
//! and `/proc`, and the engine paths under `/run/treebuild`.

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::unistd::{chdir, chroot};

use super::caps::drop_bounding_set;

/// System directories taken from the build root.
const SYSTEM_DIRS: &[&str] = &["usr", "bin", "sbin", "lib", "lib64"];

/// Host device nodes every step gets.
const DEVICE_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// A path made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
  /// Source path on the host.
  pub source: PathBuf,
  /// Absolute target path inside the sandbox.
  pub target: PathBuf,
  pub writable: bool,
  /// Include mounts below `source`.
  pub recursive: bool,
}

impl BindMount {
  pub fn readonly(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
      writable: false,
      recursive: false,
    }
  }

  pub fn writable(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
      writable: true,
      recursive: false,
    }
  }

  pub fn recursive(mut self) -> Self {
    self.recursive = true;
    self
  }
}

#[derive(Debug, Clone)]
pub struct IsolationPlan {
  /// Host directory that becomes `/`.
  root: PathBuf,
  binds: Vec<BindMount>,
  /// `(link, target)` pairs created inside the root.
  symlinks: Vec<(PathBuf, PathBuf)>,
  network: bool,
  keep_caps: Vec<u32>,
}

impl IsolationPlan {
  /// Plan a sandbox rooted at `root` whose system directories come from
  /// `build_root`. Real directories are bound read-only; symlinks (as on
  /// merged-usr systems) are recreated.
  pub fn new(root: PathBuf, build_root: &Path, network: bool, keep_caps: Vec<u32>) -> Self {
    let mut plan = Self {
      root,
      binds: Vec::new(),
      symlinks: Vec::new(),
      network,
      keep_caps,
    };

    for dir in SYSTEM_DIRS {
      let source = build_root.join(dir);
      let target = Path::new("/").join(dir);
      match fs::symlink_metadata(&source) {
        Ok(meta) if meta.file_type().is_symlink() => {
          if let Ok(dest) = fs::read_link(&source) {
            plan.symlinks.push((target, dest));
          }
        }
        Ok(meta) if meta.is_dir() => plan.binds.push(BindMount::readonly(source, target)),
        _ => {}
      }
    }
    plan
  }

  pub fn bind(&mut self, bind: BindMount) {
    self.binds.push(bind);
  }

  pub fn binds(&self) -> &[BindMount] {
    &self.binds
  }

  pub fn symlinks(&self) -> &[(PathBuf, PathBuf)] {
    &self.symlinks
  }

  fn inside(&self, target: &Path) -> PathBuf {
    self.root.join(target.strip_prefix("/").unwrap_or(target))
  }

  /// Lower the plan to raw setup operations.
  ///
  /// Runs in the parent: every path is converted and every directory the
  /// child must create is listed here, so [`PreparedIsolation::apply`] never
  /// allocates after fork.
  pub fn prepare(&self) -> io::Result<PreparedIsolation> {
    let mut ops = SetupOps::new(&self.root);

    // keep everything below from propagating to the host
    ops.mount(None, Path::new("/"), None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)?;
    ops.mount(
      Some("tmpfs"),
      &self.root,
      Some("tmpfs"),
      MsFlags::empty(),
      Some("mode=0755"),
    )?;

    for (name, mode) in [("dev", "mode=0755"), ("tmp", "mode=1777"), ("var", "mode=0755")] {
      let target = self.root.join(name);
      ops.dir(&target)?;
      ops.mount(
        Some("tmpfs"),
        &target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(mode),
      )?;
    }

    let proc_dir = self.root.join("proc");
    ops.dir(&proc_dir)?;
    ops.mount(
      Some("proc"),
      &proc_dir,
      Some("proc"),
      MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
      None,
    )?;

    for node in DEVICE_NODES {
      let source = Path::new("/dev").join(node);
      if source.exists() {
        self.bind_ops(&mut ops, &BindMount::writable(&source, &source))?;
      }
    }

    for (link, dest) in &self.symlinks {
      let link = self.inside(link);
      if let Some(parent) = link.parent() {
        ops.dir(parent)?;
      }
      ops.push(SetupOp::Symlink {
        dest: c_path(dest)?,
        link: c_path(&link)?,
      });
    }

    for bind in &self.binds {
      self.bind_ops(&mut ops, bind)?;
    }

    let mut unshare_flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;
    if !self.network {
      unshare_flags |= CloneFlags::CLONE_NEWNET;
    }

    Ok(PreparedIsolation {
      unshare: unshare_flags,
      ops: ops.ops,
      root: c_path(&self.root)?,
      keep_caps: self.keep_caps.clone(),
    })
  }

  fn bind_ops(&self, ops: &mut SetupOps, bind: &BindMount) -> io::Result<()> {
    let target = self.inside(&bind.target);
    if bind.source.is_dir() {
      ops.dir(&target)?;
    } else {
      if let Some(parent) = target.parent() {
        ops.dir(parent)?;
      }
      ops.push(SetupOp::Touch(c_path(&target)?));
    }

    let mut flags = MsFlags::MS_BIND;
    if bind.recursive {
      flags |= MsFlags::MS_REC;
    }
    ops.push(SetupOp::Mount {
      source: Some(c_path(&bind.source)?),
      target: c_path(&target)?,
      fstype: None,
      flags,
      data: None,
    });

    if !bind.writable {
      ops.mount(
        None,
        &target,
        None,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None,
      )?;
    }
    Ok(())
  }
}

fn c_path(path: &Path) -> io::Result<CString> {
  CString::new(path.as_os_str().as_bytes()).map_err(|_| {
    io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("path {} contains a NUL byte", path.display()),
    )
  })
}

fn c_str(value: &str) -> io::Result<CString> {
  CString::new(value).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in mount argument"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SetupOp {
  /// `mkdir`, tolerating an existing directory.
  Mkdir(CString),
  /// Create an empty file to bind a non-directory onto.
  Touch(CString),
  Symlink {
    dest: CString,
    link: CString,
  },
  Mount {
    source: Option<CString>,
    target: CString,
    fstype: Option<CString>,
    flags: MsFlags,
    data: Option<CString>,
  },
}

impl SetupOp {
  fn run(&self) -> io::Result<()> {
    match self {
      SetupOp::Mkdir(path) => {
        // SAFETY: `path` is a valid NUL-terminated string owned by the op.
        if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 {
          let err = io::Error::last_os_error();
          if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
          }
        }
        Ok(())
      }
      SetupOp::Touch(path) => {
        // SAFETY: as above; the descriptor is closed right away.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC, 0o644) };
        if fd < 0 {
          return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just opened and is not used again.
        unsafe { libc::close(fd) };
        Ok(())
      }
      SetupOp::Symlink { dest, link } => {
        // SAFETY: both strings are valid and NUL-terminated.
        if unsafe { libc::symlink(dest.as_ptr(), link.as_ptr()) } != 0 {
          return Err(io::Error::last_os_error());
        }
        Ok(())
      }
      SetupOp::Mount {
        source,
        target,
        fstype,
        flags,
        data,
      } => {
        mount::<CStr, CStr, CStr, CStr>(
          source.as_deref(),
          target.as_c_str(),
          fstype.as_deref(),
          *flags,
          data.as_deref(),
        )?;
        Ok(())
      }
    }
  }
}

/// Collects operations and the directories they need, each created once.
struct SetupOps {
  root: PathBuf,
  created: BTreeSet<PathBuf>,
  ops: Vec<SetupOp>,
}

impl SetupOps {
  fn new(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
      created: BTreeSet::new(),
      ops: Vec::new(),
    }
  }

  fn push(&mut self, op: SetupOp) {
    self.ops.push(op);
  }

  /// Create `dir` and its missing ancestors below the root.
  fn dir(&mut self, dir: &Path) -> io::Result<()> {
    let Ok(relative) = dir.strip_prefix(&self.root) else {
      return Ok(());
    };
    let mut current = self.root.clone();
    for component in relative.components() {
      current.push(component);
      if self.created.insert(current.clone()) {
        self.ops.push(SetupOp::Mkdir(c_path(&current)?));
      }
    }
    Ok(())
  }

  fn mount(
    &mut self,
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
  ) -> io::Result<()> {
    let op = SetupOp::Mount {
      source: source.map(c_str).transpose()?,
      target: c_path(target)?,
      fstype: fstype.map(c_str).transpose()?,
      flags,
      data: data.map(c_str).transpose()?,
    };
    self.ops.push(op);
    Ok(())
  }
}

/// An [`IsolationPlan`] ready to be entered from a forked child.
#[derive(Debug)]
pub struct PreparedIsolation {
  unshare: CloneFlags,
  ops: Vec<SetupOp>,
  root: CString,
  keep_caps: Vec<u32>,
}

impl PreparedIsolation {
  /// Enter the sandbox. Only called in the child process before exec; makes
  /// raw syscalls on prepared data and nothing else.
  pub fn apply(&self) -> io::Result<()> {
    unshare(self.unshare)?;
    for op in &self.ops {
      op.run()?;
    }
    chroot(self.root.as_c_str())?;
    chdir(c"/")?;
    drop_bounding_set(&self.keep_caps)
  }
}
