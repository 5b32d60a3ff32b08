//! Client side of long-lived service modules (devices and mounts).

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{Message, read_message, write_message};
use super::{IpcError, describe_status};

/// How long a service gets to exit after its stdin is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A running service module.
///
/// The child is killed if the client is dropped without [`close`](Self::close).
pub struct ServiceClient {
  module: String,
  child: Child,
  stdin: Option<ChildStdin>,
  stdout: BufReader<ChildStdout>,
  stderr: Option<JoinHandle<String>>,
}

impl ServiceClient {
  pub fn spawn(module: &str, mut cmd: Command) -> Result<Self, IpcError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| IpcError::Spawn { program, source })?;
    let stdin = child.stdin.take();
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| IpcError::Protocol("service stdout not captured".to_string()))?;
    let stderr = child.stderr.take().map(|mut stderr| {
      tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
      })
    });

    debug!(module, "service started");
    Ok(Self {
      module: module.to_string(),
      child,
      stdin,
      stdout: BufReader::new(stdout),
      stderr,
    })
  }

  pub fn module(&self) -> &str {
    &self.module
  }

  /// Call `method` and wait for its reply.
  pub async fn call(&mut self, method: &str, args: Value) -> Result<Value, IpcError> {
    let Some(stdin) = self.stdin.as_mut() else {
      return Err(IpcError::Protocol(format!("service {} already closed", self.module)));
    };
    if let Err(e) = write_message(stdin, &Message::method(method, args)).await {
      debug!(module = %self.module, error = %e, "failed to send method call");
      return Err(self.closed().await);
    }

    match read_message(&mut self.stdout).await? {
      Some(Message::Reply { reply }) => Ok(reply),
      Some(Message::Exception { name, value }) => Err(IpcError::Exception {
        module: self.module.clone(),
        name,
        value,
      }),
      Some(Message::Method { name, .. }) => Err(IpcError::Protocol(format!(
        "service {} sent unexpected method call '{name}'",
        self.module
      ))),
      None => Err(self.closed().await),
    }
  }

  async fn closed(&mut self) -> IpcError {
    self.stdin = None;
    let status = tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await;
    let mut stderr = self.take_stderr().await;
    if let Ok(Ok(status)) = status {
      stderr = format!("{} ({})", stderr.trim(), describe_status(&status));
    }
    IpcError::Closed {
      module: self.module.clone(),
      stderr,
    }
  }

  async fn take_stderr(&mut self) -> String {
    match self.stderr.take() {
      Some(task) => task.await.unwrap_or_default(),
      None => String::new(),
    }
  }

  /// Close stdin and wait for the service to exit, returning its stderr.
  ///
  /// A service that does not exit within [`SHUTDOWN_GRACE`] is killed.
  pub async fn close(mut self) -> Result<String, IpcError> {
    self.stdin = None;

    let status = match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
      Ok(status) => status?,
      Err(_) => {
        warn!(module = %self.module, "service did not exit after close, killing");
        self.child.kill().await?;
        return Err(IpcError::Timeout(SHUTDOWN_GRACE));
      }
    };

    let stderr = self.take_stderr().await;
    if !status.success() {
      return Err(IpcError::Failed {
        module: self.module.clone(),
        status: describe_status(&status),
        stderr: stderr.trim().to_string(),
      });
    }
    debug!(module = %self.module, "service exited");
    Ok(stderr)
  }
}
