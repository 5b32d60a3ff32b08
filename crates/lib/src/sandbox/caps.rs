//! Linux capability names and the bounding-set drop applied to steps.

use std::io;

/// Capabilities every step keeps, on top of what its module declares.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
  "CAP_AUDIT_WRITE",
  "CAP_CHOWN",
  "CAP_DAC_OVERRIDE",
  "CAP_DAC_READ_SEARCH",
  "CAP_FOWNER",
  "CAP_FSETID",
  "CAP_IPC_LOCK",
  "CAP_LINUX_IMMUTABLE",
  "CAP_MAC_OVERRIDE",
  "CAP_MKNOD",
  "CAP_NET_BIND_SERVICE",
  "CAP_SETFCAP",
  "CAP_SETGID",
  "CAP_SETPCAP",
  "CAP_SETUID",
  "CAP_SYS_CHROOT",
  "CAP_SYS_NICE",
  "CAP_SYS_RESOURCE",
];

const CAPABILITY_NAMES: &[&str] = &[
  "CAP_CHOWN",
  "CAP_DAC_OVERRIDE",
  "CAP_DAC_READ_SEARCH",
  "CAP_FOWNER",
  "CAP_FSETID",
  "CAP_KILL",
  "CAP_SETGID",
  "CAP_SETUID",
  "CAP_SETPCAP",
  "CAP_LINUX_IMMUTABLE",
  "CAP_NET_BIND_SERVICE",
  "CAP_NET_BROADCAST",
  "CAP_NET_ADMIN",
  "CAP_NET_RAW",
  "CAP_IPC_LOCK",
  "CAP_IPC_OWNER",
  "CAP_SYS_MODULE",
  "CAP_SYS_RAWIO",
  "CAP_SYS_CHROOT",
  "CAP_SYS_PTRACE",
  "CAP_SYS_PACCT",
  "CAP_SYS_ADMIN",
  "CAP_SYS_BOOT",
  "CAP_SYS_NICE",
  "CAP_SYS_RESOURCE",
  "CAP_SYS_TIME",
  "CAP_SYS_TTY_CONFIG",
  "CAP_MKNOD",
  "CAP_LEASE",
  "CAP_AUDIT_WRITE",
  "CAP_AUDIT_CONTROL",
  "CAP_SETFCAP",
  "CAP_MAC_OVERRIDE",
  "CAP_MAC_ADMIN",
  "CAP_SYSLOG",
  "CAP_WAKE_ALARM",
  "CAP_BLOCK_SUSPEND",
  "CAP_AUDIT_READ",
  "CAP_PERFMON",
  "CAP_BPF",
  "CAP_CHECKPOINT_RESTORE",
];

/// Kernel number of a capability name such as `CAP_SYS_ADMIN`.
pub fn capability_number(name: &str) -> Option<u32> {
  CAPABILITY_NAMES.iter().position(|c| *c == name).map(|i| i as u32)
}

/// Capabilities to keep for a module declaring `extra`, as kernel numbers.
///
/// Unknown names are returned as the error.
pub fn keep_set(extra: &[String]) -> Result<Vec<u32>, String> {
  let mut keep = Vec::new();
  for name in DEFAULT_CAPABILITIES.iter().copied().chain(extra.iter().map(String::as_str)) {
    let number = capability_number(name).ok_or_else(|| name.to_string())?;
    if !keep.contains(&number) {
      keep.push(number);
    }
  }
  keep.sort_unstable();
  Ok(keep)
}

/// Drop every capability not in `keep` from the bounding set of the calling
/// process. Runs between fork and exec, so it only makes raw syscalls.
pub fn drop_bounding_set(keep: &[u32]) -> io::Result<()> {
  for cap in 0..=63u32 {
    if keep.contains(&cap) {
      continue;
    }
    // SAFETY: prctl with PR_CAPBSET_DROP takes a capability number and no pointers.
    let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
      let err = io::Error::last_os_error();
      // numbers beyond the kernel's last capability
      if err.raw_os_error() == Some(libc::EINVAL) {
        break;
      }
      return Err(err);
    }
  }
  Ok(())
}
