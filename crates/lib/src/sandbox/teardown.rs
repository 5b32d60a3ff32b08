//! Release of devices and mounts held by a step.
//!
//! Resources are pushed as they are acquired and released in reverse. A
//! release failure does not stop the unwind: every remaining resource is
//! still released and all failures are reported together.

use serde_json::Value;
use tracing::{debug, warn};

use crate::ipc::service::ServiceClient;
use crate::modules::ModuleKind;

struct Held {
  kind: ModuleKind,
  name: String,
  release: &'static str,
  client: ServiceClient,
}

#[derive(Default)]
pub struct Teardown {
  stack: Vec<Held>,
}

impl Teardown {
  /// Register a live service, released by calling `release` on it.
  pub fn push(&mut self, kind: ModuleKind, name: &str, release: &'static str, client: ServiceClient) {
    self.stack.push(Held {
      kind,
      name: name.to_string(),
      release,
      client,
    });
  }

  pub fn len(&self) -> usize {
    self.stack.len()
  }

  pub fn is_empty(&self) -> bool {
    self.stack.is_empty()
  }

  /// Release everything, last acquired first. Returns one message per failure.
  pub async fn unwind(mut self) -> Vec<String> {
    let mut errors = Vec::new();

    while let Some(mut held) = self.stack.pop() {
      debug!(kind = %held.kind, name = %held.name, method = held.release, "releasing");

      if let Err(e) = held.client.call(held.release, Value::Null).await {
        warn!(kind = %held.kind, name = %held.name, error = %e, "release failed");
        errors.push(format!("{} '{}': {e}", held.kind, held.name));
      }
      if let Err(e) = held.client.close().await {
        warn!(kind = %held.kind, name = %held.name, error = %e, "module did not exit cleanly");
        errors.push(format!("{} '{}': {e}", held.kind, held.name));
      }
    }

    errors
  }
}
