//! Device services.
//!
//! A device module is started as a service and asked to `open` the device.
//! Its reply (typically `{"path": "/dev/loop0"}`) is the handle given to
//! child devices, mounts and the step. The service stays alive until the
//! device is released with `close` during teardown.

use std::path::Path;

use serde_json::{Value, json};
use tracing::info;

use super::{SandboxError, host_command};
use crate::ipc::service::ServiceClient;
use crate::resolve::ResolvedDevice;

pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";

/// Start the module for `device` and open it.
///
/// On failure the service has already been shut down.
pub async fn open(
  device: &ResolvedDevice,
  parent: Option<&Value>,
  tree: &Path,
  api: &Path,
) -> Result<(ServiceClient, Value), SandboxError> {
  let fail = |message: String| SandboxError::Device {
    name: device.name.clone(),
    message,
  };
  let executable = device
    .module
    .executable()
    .ok_or_else(|| fail("device modules must be executables".to_string()))?;

  let mut client = ServiceClient::spawn(&device.module.name, host_command(executable, tree)).map_err(|e| fail(e.to_string()))?;
  let args = json!({
    "options": device.options,
    "parent": parent,
    "tree": tree,
    "api": api,
  });

  match client.call(OPEN, args).await {
    Ok(reply) => {
      info!(device = %device.name, module = %device.module.name, "device opened");
      Ok((client, reply))
    }
    Err(e) => {
      let _ = client.close().await;
      Err(fail(e.to_string()))
    }
  }
}
