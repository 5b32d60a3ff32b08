//! Mount services.
//!
//! A mount module attaches the filesystem of a device below the step's mount
//! root. Mounts are established in declaration order, so a mount at `/boot`
//! listed after `/` lands inside the already mounted root filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::info;

use super::{SandboxError, host_command};
use crate::ipc::service::ServiceClient;
use crate::resolve::ResolvedMount;

pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";

/// Host path of a mount target below `root`.
pub fn mountpoint(root: &Path, target: &str) -> PathBuf {
  root.join(target.trim_start_matches('/'))
}

/// Start the module for `mount` and attach the filesystem on `device`.
pub async fn attach(
  mount: &ResolvedMount,
  device: &Value,
  root: &Path,
  api: &Path,
) -> Result<(ServiceClient, Value), SandboxError> {
  let fail = |message: String| SandboxError::Mount {
    name: mount.name.clone(),
    message,
  };
  let executable = mount
    .module
    .executable()
    .ok_or_else(|| fail("mount modules must be executables".to_string()))?;

  let path = mountpoint(root, &mount.target);
  fs::create_dir_all(&path).map_err(|e| fail(format!("cannot create {}: {e}", path.display())))?;

  let mut client = ServiceClient::spawn(&mount.module.name, host_command(executable, root)).map_err(|e| fail(e.to_string()))?;
  let args = json!({
    "source": device,
    "root": root,
    "target": mount.target,
    "path": path,
    "options": mount.options,
    "api": api,
  });

  match client.call(MOUNT, args).await {
    Ok(reply) => {
      info!(mount = %mount.name, target = %mount.target, "mounted");
      Ok((client, reply))
    }
    Err(e) => {
      let _ = client.close().await;
      Err(fail(e.to_string()))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mountpoints_stay_below_root() {
    let root = Path::new("/run/x/mounts");
    assert_eq!(mountpoint(root, "/"), PathBuf::from("/run/x/mounts/"));
    assert_eq!(mountpoint(root, "/boot/efi"), PathBuf::from("/run/x/mounts/boot/efi"));
  }
}
