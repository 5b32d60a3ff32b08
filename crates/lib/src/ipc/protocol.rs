//! Wire format of the module protocol.
//!
//! - **Encoding**: JSON
//! - **Framing**: newline-delimited, one message per line
//!
//! ```text
//! engine                              module
//!   |  {"type":"method","data":{"name":"open","args":{...}}}\n
//!   |------------------------------------------------------->|
//!   |  {"type":"reply","data":{"reply":{"path":"/dev/loop3"}}}\n
//!   |<-------------------------------------------------------|
//! ```
//!
//! A module that cannot satisfy a call answers with an `exception` message
//! instead of a reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::IpcError;

/// Upper bound on one framed message.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
  Method {
    name: String,
    #[serde(default)]
    args: Value,
  },
  Reply {
    #[serde(default)]
    reply: Value,
  },
  Exception {
    name: String,
    #[serde(default)]
    value: String,
  },
}

impl Message {
  pub fn method(name: &str, args: Value) -> Self {
    Message::Method {
      name: name.to_string(),
      args,
    }
  }

  pub fn reply(reply: Value) -> Self {
    Message::Reply { reply }
  }

  pub fn exception(name: &str, value: impl Into<String>) -> Self {
    Message::Exception {
      name: name.to_string(),
      value: value.into(),
    }
  }

  /// Serialize with the trailing newline.
  pub fn to_json_line(&self) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(self)?;
    line.push('\n');
    Ok(line)
  }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<(), IpcError> {
  writer.write_all(message.to_json_line()?.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// Read the next message. `Ok(None)` means the peer closed the stream.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Message>, IpcError> {
  let mut line = String::new();
  loop {
    line.clear();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      return Ok(None);
    }
    if n > MAX_MESSAGE_LEN {
      return Err(IpcError::Protocol(format!("message of {n} bytes exceeds the limit")));
    }
    if line.trim().is_empty() {
      continue;
    }
    return serde_json::from_str(line.trim())
      .map(Some)
      .map_err(|e| IpcError::Protocol(format!("malformed message: {e}")));
  }
}
