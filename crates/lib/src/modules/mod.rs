//! Module registry.
//!
//! Every source, input, device, mount and step is a *module* selected by a
//! type string. The registry maps `(kind, type)` to an implementation: either
//! one compiled into the engine or an executable in the library directory at
//! `<libdir>/<kind>s/<type>`, optionally described by a sidecar
//! `<type>.meta.json`:
//!
//! ```json
//! {
//!   "summary": "Create a file",
//!   "capabilities": ["CAP_MKNOD"],
//!   "network": false,
//!   "schema": { "type": "object", "required": ["path"] }
//! }
//! ```

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use schema::ValidationIssue;

/// Content type of checksum-named files fetched by sources.
pub const FILES_CONTENT_TYPE: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
  Source,
  Input,
  Device,
  Mount,
  Step,
}

impl ModuleKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ModuleKind::Source => "source",
      ModuleKind::Input => "input",
      ModuleKind::Device => "device",
      ModuleKind::Mount => "mount",
      ModuleKind::Step => "step",
    }
  }

  /// Subdirectory of the library directory holding modules of this kind.
  pub fn dir_name(&self) -> &'static str {
    match self {
      ModuleKind::Source => "sources",
      ModuleKind::Input => "inputs",
      ModuleKind::Device => "devices",
      ModuleKind::Mount => "mounts",
      ModuleKind::Step => "steps",
    }
  }
}

impl fmt::Display for ModuleKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Static description of a module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMeta {
  pub summary: Option<String>,
  /// Capabilities kept in the bounding set in addition to the defaults.
  pub capabilities: Vec<String>,
  /// Whether the module needs the host network namespace.
  pub network: bool,
  /// Schema for the `options` object.
  pub schema: Option<Value>,
  /// Schema for each item of a source.
  pub item_schema: Option<Value>,
  /// Cache namespace a source fills. Items of the `files` namespace are
  /// named by checksum and verified after every fetch.
  pub content_type: Option<String>,
}

impl ModuleMeta {
  pub fn content_type(&self) -> &str {
    self.content_type.as_deref().unwrap_or(FILES_CONTENT_TYPE)
  }
}

/// Modules implemented inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
  InlineSource,
  CurlSource,
  TreeInput,
  FilesInput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleImpl {
  Builtin(Builtin),
  External(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
  pub kind: ModuleKind,
  pub name: String,
  pub implementation: ModuleImpl,
  pub meta: ModuleMeta,
}

impl ModuleInfo {
  /// Validate an options object against the module schema, if it has one.
  pub fn validate_options(&self, options: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    if !options.is_object() {
      issues.push(ValidationIssue::new(path, "options must be an object"));
      return;
    }
    if let Some(schema) = &self.meta.schema {
      schema::validate(schema, options, path, issues);
    }
  }

  pub fn executable(&self) -> Option<&Path> {
    match &self.implementation {
      ModuleImpl::External(path) => Some(path),
      ModuleImpl::Builtin(_) => None,
    }
  }
}

#[derive(Debug, Error)]
pub enum ModuleError {
  #[error("unknown {kind} module '{name}' (looked for {path})")]
  NotFound { kind: ModuleKind, name: String, path: PathBuf },

  #[error("invalid {kind} module name '{name}'")]
  InvalidName { kind: ModuleKind, name: String },

  #[error("{kind} module '{name}' at {path} is not executable")]
  NotExecutable { kind: ModuleKind, name: String, path: PathBuf },

  #[error("failed to load module metadata {path}: {message}")]
  Meta { path: PathBuf, message: String },
}

/// Maps module type names to implementations.
pub struct ModuleRegistry {
  libdir: PathBuf,
  builtins: BTreeMap<(ModuleKind, String), Arc<ModuleInfo>>,
}

impl ModuleRegistry {
  /// Create a registry over `libdir` with the built-in modules registered.
  pub fn new(libdir: impl Into<PathBuf>) -> Self {
    let mut registry = Self {
      libdir: libdir.into(),
      builtins: BTreeMap::new(),
    };

    registry.register_builtin(
      ModuleKind::Source,
      "inline",
      Builtin::InlineSource,
      ModuleMeta {
        summary: Some("Data embedded in the manifest".to_string()),
        item_schema: Some(json!({
          "type": "object",
          "required": ["encoding", "data"],
          "additionalProperties": false,
          "properties": {
            "encoding": {"enum": ["base64"]},
            "data": {"type": "string"}
          }
        })),
        ..Default::default()
      },
    );
    registry.register_builtin(
      ModuleKind::Source,
      "curl",
      Builtin::CurlSource,
      ModuleMeta {
        summary: Some("Download files over HTTP(S)".to_string()),
        network: true,
        item_schema: Some(json!({
          "type": ["string", "object"],
          "required": ["url"],
          "properties": {"url": {"type": "string", "minLength": 1}}
        })),
        ..Default::default()
      },
    );
    registry.register_builtin(
      ModuleKind::Input,
      "tree",
      Builtin::TreeInput,
      ModuleMeta {
        summary: Some("Tree of another pipeline".to_string()),
        schema: Some(json!({"type": "object", "additionalProperties": false})),
        ..Default::default()
      },
    );
    registry.register_builtin(
      ModuleKind::Input,
      "files",
      Builtin::FilesInput,
      ModuleMeta {
        summary: Some("Files fetched by sources".to_string()),
        schema: Some(json!({"type": "object", "additionalProperties": false})),
        ..Default::default()
      },
    );

    registry
  }

  /// Register a built-in module, replacing any previous registration.
  pub fn register_builtin(&mut self, kind: ModuleKind, name: &str, builtin: Builtin, meta: ModuleMeta) {
    self.builtins.insert(
      (kind, name.to_string()),
      Arc::new(ModuleInfo {
        kind,
        name: name.to_string(),
        implementation: ModuleImpl::Builtin(builtin),
        meta,
      }),
    );
  }

  pub fn libdir(&self) -> &Path {
    &self.libdir
  }

  /// Find the module implementing `name` for `kind`.
  pub fn lookup(&self, kind: ModuleKind, name: &str) -> Result<Arc<ModuleInfo>, ModuleError> {
    if let Some(info) = self.builtins.get(&(kind, name.to_string())) {
      return Ok(Arc::clone(info));
    }

    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\0') {
      return Err(ModuleError::InvalidName {
        kind,
        name: name.to_string(),
      });
    }

    let dir = self.libdir.join(kind.dir_name());
    let path = dir.join(name);
    let metadata = match std::fs::metadata(&path) {
      Ok(m) if m.is_file() => m,
      Ok(_) | Err(_) => {
        return Err(ModuleError::NotFound {
          kind,
          name: name.to_string(),
          path,
        });
      }
    };
    if !is_executable(&metadata) {
      return Err(ModuleError::NotExecutable {
        kind,
        name: name.to_string(),
        path,
      });
    }

    let meta = load_meta(&dir.join(format!("{name}.meta.json")))?;
    debug!(%kind, module = name, path = %path.display(), "resolved external module");

    Ok(Arc::new(ModuleInfo {
      kind,
      name: name.to_string(),
      implementation: ModuleImpl::External(path),
      meta,
    }))
  }
}

fn load_meta(path: &Path) -> Result<ModuleMeta, ModuleError> {
  match std::fs::read(path) {
    Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ModuleError::Meta {
      path: path.to_path_buf(),
      message: e.to_string(),
    }),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ModuleMeta::default()),
    Err(e) => Err(ModuleError::Meta {
      path: path.to_path_buf(),
      message: e.to_string(),
    }),
  }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
  true
}
