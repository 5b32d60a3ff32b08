pub mod paths;

/// Whether the current process runs with an effective uid of 0.
#[cfg(unix)]
pub fn is_root() -> bool {
  nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
  false
}
