//! Module IPC.
//!
//! Every module runs as a separate process. Two calling conventions exist:
//!
//! - **one-shot** (sources, inputs, steps): the engine writes one JSON
//!   request to the module's stdin and closes it. Sources and inputs answer
//!   with one JSON document on stdout; steps report through their exit
//!   status, with stdout/stderr captured for diagnostics.
//! - **service** (devices, mounts): the module stays alive and answers
//!   newline-delimited method calls (see [`protocol`]) until its stdin is
//!   closed. See [`service::ServiceClient`].
//!
//! Modules that need the engine to do something on their behalf (read a
//! cached tree, locate a source cache) talk to the [`api::HostApi`] socket
//! named in their request.

pub mod api;
pub mod protocol;
pub mod service;

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IpcError {
  #[error("failed to start module {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("module I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("failed to encode module message: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("module {module} returned an invalid reply: {message}")]
  Decode { module: String, message: String },

  #[error("module {module} failed ({status}): {stderr}")]
  Failed {
    module: String,
    status: String,
    stderr: String,
  },

  #[error("module {module} raised {name}: {value}")]
  Exception {
    module: String,
    name: String,
    value: String,
  },

  #[error("module {module} closed the connection unexpectedly: {stderr}")]
  Closed { module: String, stderr: String },

  #[error("module timed out after {0:?}")]
  Timeout(Duration),

  #[error("protocol error: {0}")]
  Protocol(String),
}

/// What a one-shot module produced.
#[derive(Debug)]
pub struct ModuleOutput {
  pub status: ExitStatus,
  pub stdout: String,
  pub stderr: String,
  pub duration: Duration,
}

impl ModuleOutput {
  pub fn success(&self) -> bool {
    self.status.success()
  }

  /// Human readable exit status, distinguishing signals from exit codes.
  pub fn describe_status(&self) -> String {
    describe_status(&self.status)
  }
}

#[cfg(unix)]
pub fn describe_status(status: &ExitStatus) -> String {
  use std::os::unix::process::ExitStatusExt;

  match (status.code(), status.signal()) {
    (Some(code), _) => format!("exit status {code}"),
    (None, Some(signal)) => format!("killed by signal {signal}"),
    (None, None) => "unknown exit status".to_string(),
  }
}

#[cfg(not(unix))]
pub fn describe_status(status: &ExitStatus) -> String {
  status.to_string()
}

/// Run a one-shot module: send `request` on stdin, collect its output.
///
/// The command's environment, working directory and isolation are the
/// caller's business; this only wires up the standard streams. With a
/// `timeout`, the module is killed when it expires.
pub async fn call_oneshot(
  mut cmd: Command,
  request: &Value,
  timeout: Option<Duration>,
) -> Result<ModuleOutput, IpcError> {
  let program = cmd.as_std().get_program().to_string_lossy().to_string();
  cmd
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let start = Instant::now();
  let mut child = cmd.spawn().map_err(|source| IpcError::Spawn {
    program: program.clone(),
    source,
  })?;

  let mut body = serde_json::to_vec(request)?;
  body.push(b'\n');
  let writer = child.stdin.take().map(|mut stdin| {
    tokio::spawn(async move {
      // a module may exit without reading its request
      match stdin.write_all(&body).await {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
        _ => Ok(()),
      }
    })
  });

  let output = match timeout {
    Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
      .await
      .map_err(|_| IpcError::Timeout(limit))??,
    None => child.wait_with_output().await?,
  };

  if let Some(writer) = writer
    && let Ok(Err(e)) = writer.await
  {
    debug!(program = %program, error = %e, "failed to write module request");
  }

  Ok(ModuleOutput {
    status: output.status,
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    duration: start.elapsed(),
  })
}

/// Decode the stdout of a successful one-shot module.
pub fn parse_reply<T: DeserializeOwned>(module: &str, output: &ModuleOutput) -> Result<T, IpcError> {
  if !output.success() {
    return Err(IpcError::Failed {
      module: module.to_string(),
      status: output.describe_status(),
      stderr: output.stderr.trim().to_string(),
    });
  }
  serde_json::from_str(output.stdout.trim()).map_err(|e| IpcError::Decode {
    module: module.to_string(),
    message: e.to_string(),
  })
}
