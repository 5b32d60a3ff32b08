//! Materializing step inputs.
//!
//! Every input becomes one host path plus a JSON `data` document describing
//! what is in it. Built-in `tree` inputs point at a committed store tree;
//! built-in `files` inputs get a directory of cached source files named by
//! checksum. External input modules are asked to fill a target directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{SandboxError, host_command};
use crate::ipc::{call_oneshot, parse_reply};
use crate::modules::{Builtin, FILES_CONTENT_TYPE, ModuleImpl};
use crate::resolve::ResolvedInput;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInput {
  pub name: String,
  /// Where the input lives on the host.
  pub path: PathBuf,
  pub data: Value,
}

#[derive(Deserialize)]
struct InputReply {
  path: Option<PathBuf>,
  #[serde(default)]
  data: Value,
}

/// Make `input` available, using `target` as its directory when one is needed.
pub async fn prepare(
  input: &ResolvedInput,
  store: &Store,
  target: &Path,
  api: &Path,
  timeout: Option<Duration>,
) -> Result<PreparedInput, SandboxError> {
  let fail = |message: String| SandboxError::Input {
    name: input.name.clone(),
    message,
  };

  match &input.module.implementation {
    ModuleImpl::Builtin(Builtin::TreeInput) => {
      let reference = input.refs.first().ok_or_else(|| fail("no pipeline reference".to_string()))?;
      let Some(id) = &reference.pipeline else {
        return Err(fail(format!("'{}' is not a pipeline", reference.reference)));
      };
      let tree = store
        .read(id)?
        .ok_or_else(|| fail(format!("pipeline '{}' ({id}) is not in the store", reference.reference)))?;

      debug!(input = %input.name, pipeline = %reference.reference, "tree input");
      Ok(PreparedInput {
        name: input.name.clone(),
        path: tree.tree(),
        data: json!({"refs": {id.as_str(): reference.options}}),
      })
    }

    ModuleImpl::Builtin(Builtin::FilesInput) => {
      let cache = store.source_cache(FILES_CONTENT_TYPE)?;
      fs::create_dir_all(target).map_err(|e| SandboxError::io(target, e))?;

      let mut files = Map::new();
      for reference in &input.refs {
        let source = cache.join(&reference.reference);
        let dest = target.join(&reference.reference);
        if !source.is_file() {
          return Err(fail(format!("source item {} was not fetched", reference.reference)));
        }
        // a copy is the fallback when the cache is on another filesystem
        if fs::hard_link(&source, &dest).is_err() {
          fs::copy(&source, &dest).map_err(|e| SandboxError::io(&dest, e))?;
        }
        files.insert(reference.reference.clone(), reference.options.clone());
      }

      debug!(input = %input.name, files = files.len(), "files input");
      Ok(PreparedInput {
        name: input.name.clone(),
        path: target.to_path_buf(),
        data: json!({"files": files}),
      })
    }

    ModuleImpl::Builtin(other) => Err(fail(format!("{other:?} is not an input module"))),

    ModuleImpl::External(executable) => {
      fs::create_dir_all(target).map_err(|e| SandboxError::io(target, e))?;

      let mut refs = Map::new();
      for reference in &input.refs {
        let mut entry = json!({"options": reference.options});
        if let Some(id) = &reference.pipeline {
          entry["id"] = json!(id);
          if let Some(tree) = store.read(id)? {
            entry["path"] = json!(tree.tree());
          }
        }
        refs.insert(reference.reference.clone(), entry);
      }

      let request = json!({
        "origin": input.origin.as_str(),
        "refs": refs,
        "options": input.options,
        "target": target,
        "api": api,
      });

      let output = call_oneshot(host_command(executable, target), &request, timeout)
        .await
        .map_err(|e| fail(e.to_string()))?;
      let reply: InputReply = parse_reply(&input.module.name, &output).map_err(|e| fail(e.to_string()))?;

      let path = match reply.path {
        Some(path) if path.is_absolute() => path,
        Some(path) => target.join(path),
        None => target.to_path_buf(),
      };
      if !path.exists() {
        return Err(fail(format!("module reported missing path {}", path.display())));
      }

      Ok(PreparedInput {
        name: input.name.clone(),
        path,
        data: reply.data,
      })
    }
  }
}
