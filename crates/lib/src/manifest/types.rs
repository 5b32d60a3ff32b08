//! Manifest types for treebuild.
//!
//! The manifest is the declarative input to a run: an ordered list of
//! pipelines, each an ordered list of stages, plus the sources those stages
//! draw content from.
//!
//! # Example
//!
//! ```json
//! {
//!   "version": "2",
//!   "pipelines": [
//!     {
//!       "name": "tree",
//!       "stages": [
//!         { "type": "org.example.mkfile", "options": { "path": "/newfile" } }
//!       ]
//!     }
//!   ],
//!   "sources": {
//!     "curl": { "items": { "sha256:...": "https://example.com/blob" } }
//!   }
//! }
//! ```
//!
//! Object keys inside `options` are free-form. Maps use [`BTreeMap`] so the
//! parsed model serializes deterministically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn empty_object() -> Value {
  Value::Object(serde_json::Map::new())
}

/// The complete manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
  pub version: String,
  #[serde(default)]
  pub pipelines: Vec<PipelineDesc>,
  /// Source declarations keyed by source module type.
  #[serde(default)]
  pub sources: BTreeMap<String, SourceDesc>,
}

/// A named, ordered sequence of stages producing one tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDesc {
  pub name: String,
  /// Pipeline whose tree serves as the execution root for every stage.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build: Option<String>,
  /// Fixed timestamp exported to stages as `SOURCE_DATE_EPOCH`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_epoch: Option<u64>,
  #[serde(default)]
  pub stages: Vec<StageDesc>,
}

/// One module invocation inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDesc {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default = "empty_object")]
  pub options: Value,
  #[serde(default)]
  pub inputs: BTreeMap<String, InputDesc>,
  #[serde(default)]
  pub devices: Vec<DeviceDesc>,
  #[serde(default)]
  pub mounts: Vec<MountDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputOrigin {
  Pipeline,
  Source,
}

impl InputOrigin {
  pub fn as_str(&self) -> &'static str {
    match self {
      InputOrigin::Pipeline => "pipeline",
      InputOrigin::Source => "source",
    }
  }
}

/// References of an input: either a plain list or a map of per-reference options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum References {
  List(Vec<String>),
  Map(BTreeMap<String, Value>),
}

impl Default for References {
  fn default() -> Self {
    References::List(Vec::new())
  }
}

impl References {
  /// Each reference paired with its options (`{}` for list entries).
  pub fn entries(&self) -> Vec<(String, Value)> {
    match self {
      References::List(refs) => refs.iter().map(|r| (r.clone(), empty_object())).collect(),
      References::Map(refs) => refs.iter().map(|(r, o)| (r.clone(), o.clone())).collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      References::List(refs) => refs.is_empty(),
      References::Map(refs) => refs.is_empty(),
    }
  }
}

/// A named binding a stage uses to obtain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDesc {
  #[serde(rename = "type")]
  pub kind: String,
  pub origin: InputOrigin,
  #[serde(default)]
  pub references: References,
  #[serde(default = "empty_object")]
  pub options: Value,
}

/// A block-device-like handle exposed to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceDesc {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: String,
  /// Earlier device this one is layered on (a partition on a loop device, say).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent: Option<String>,
  #[serde(default = "empty_object")]
  pub options: Value,
}

/// A filesystem from a device attached inside the stage's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountDesc {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: String,
  /// Name of the device providing the filesystem.
  pub source: String,
  pub target: String,
  #[serde(default = "empty_object")]
  pub options: Value,
}

/// Items one source module must provide, keyed by checksum or opaque reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDesc {
  #[serde(default)]
  pub items: BTreeMap<String, Value>,
  #[serde(default = "empty_object")]
  pub options: Value,
}
