//! The privileged host API.
//!
//! Modules run with a narrow privilege set. When they need something only
//! the engine may do, they connect to a Unix socket the engine serves for the
//! duration of one module call and speak the [`protocol`](super::protocol)
//! format:
//!
//! | Method         | Args           | Reply                     |
//! |----------------|----------------|---------------------------|
//! | `read_tree`    | `{id}`         | `{path}` of a cached tree |
//! | `source_cache` | `{kind}`       | `{path}` of a source cache|
//! | `set_error`    | `{message}`    | `null`                    |

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::IpcError;
use super::protocol::{Message, read_message, write_message};
use crate::store::Store;
use crate::util::hash::ObjectId;

pub const SOCKET_NAME: &str = "api.sock";

/// A running host API server.
pub struct HostApi {
  socket: PathBuf,
  task: JoinHandle<()>,
  error: Arc<Mutex<Option<String>>>,
}

impl HostApi {
  /// Bind `<dir>/api.sock` and start serving.
  pub fn start(dir: &Path, store: Store) -> Result<Self, IpcError> {
    let socket = dir.join(SOCKET_NAME);
    let listener = UnixListener::bind(&socket)?;
    let error = Arc::new(Mutex::new(None));

    let task = tokio::spawn(serve(listener, store, Arc::clone(&error)));
    debug!(socket = %socket.display(), "host api listening");

    Ok(Self { socket, task, error })
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket
  }

  /// The failure reason a module reported through `set_error`, if any.
  pub fn take_error(&self) -> Option<String> {
    self.error.lock().ok().and_then(|mut e| e.take())
  }

  /// Stop serving and remove the socket.
  pub fn shutdown(self) {
    self.task.abort();
    let _ = std::fs::remove_file(&self.socket);
  }
}

async fn serve(listener: UnixListener, store: Store, error: Arc<Mutex<Option<String>>>) {
  loop {
    match listener.accept().await {
      Ok((stream, _)) => {
        let store = store.clone();
        let error = Arc::clone(&error);
        tokio::spawn(async move {
          if let Err(e) = handle_connection(stream, &store, &error).await {
            debug!(error = %e, "host api connection ended with error");
          }
        });
      }
      Err(e) => {
        warn!(error = %e, "host api accept failed");
        return;
      }
    }
  }
}

async fn handle_connection(stream: UnixStream, store: &Store, error: &Mutex<Option<String>>) -> Result<(), IpcError> {
  let (reader, mut writer) = stream.into_split();
  let mut reader = BufReader::new(reader);

  while let Some(message) = read_message(&mut reader).await? {
    let response = dispatch(message, store, error);
    write_message(&mut writer, &response).await?;
  }
  Ok(())
}

fn dispatch(message: Message, store: &Store, error: &Mutex<Option<String>>) -> Message {
  let Message::Method { name, args } = message else {
    return Message::exception("ProtocolError", "expected a method call");
  };
  debug!(method = %name, "host api call");

  match name.as_str() {
    "read_tree" => {
      let Some(id) = args.get("id").and_then(Value::as_str).and_then(ObjectId::parse) else {
        return Message::exception("ValueError", "read_tree requires a valid 'id'");
      };
      match store.read(&id) {
        Ok(Some(tree)) => Message::reply(json!({"path": tree.tree()})),
        Ok(None) => Message::exception("NotFound", format!("object {id} is not in the store")),
        Err(e) => Message::exception("StoreError", e.to_string()),
      }
    }
    "source_cache" => {
      let Some(kind) = args.get("kind").and_then(Value::as_str) else {
        return Message::exception("ValueError", "source_cache requires 'kind'");
      };
      if kind.is_empty() || kind.contains('/') || kind.starts_with('.') {
        return Message::exception("ValueError", format!("invalid content type '{kind}'"));
      }
      match store.source_cache(kind) {
        Ok(path) => Message::reply(json!({"path": path})),
        Err(e) => Message::exception("StoreError", e.to_string()),
      }
    }
    "set_error" => {
      let message = args.get("message").and_then(Value::as_str).unwrap_or("unknown error");
      if let Ok(mut slot) = error.lock() {
        *slot = Some(message.to_string());
      }
      Message::reply(Value::Null)
    }
    other => Message::exception("UnknownMethod", format!("no such method '{other}'")),
  }
}
