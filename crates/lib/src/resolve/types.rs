//! The resolved, identifier-annotated form of a manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::manifest::InputOrigin;
use crate::modules::ModuleInfo;
use crate::modules::schema::ValidationIssue;
use crate::util::hash::{Hashable, ObjectId};

use super::dag::PipelineDag;

/// Every problem found while resolving a manifest, reported together.
#[derive(Debug, Error)]
#[error("manifest validation failed:\n{}", render_issues(.issues))]
pub struct ValidationError {
  pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
  pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      issues: vec![ValidationIssue::new(path, message)],
    }
  }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
  issues.iter().map(|i| format!("  {i}")).collect::<Vec<_>>().join("\n")
}

/// A reference to another pipeline by name and identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRef {
  pub name: String,
  pub id: ObjectId,
}

/// One reference inside an input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRef {
  /// Pipeline name (origin `pipeline`) or source item key (origin `source`).
  pub reference: String,
  /// Identifier of the referenced pipeline.
  pub pipeline: Option<ObjectId>,
  pub options: Value,
}

impl InputRef {
  /// The key this reference contributes to identifiers.
  pub fn identity_key(&self) -> &str {
    self.pipeline.as_ref().map(ObjectId::as_str).unwrap_or(&self.reference)
  }
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
  pub name: String,
  pub id: ObjectId,
  pub module: Arc<ModuleInfo>,
  pub origin: InputOrigin,
  pub refs: Vec<InputRef>,
  pub options: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedDevice {
  pub name: String,
  pub id: ObjectId,
  pub module: Arc<ModuleInfo>,
  pub parent: Option<String>,
  pub options: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedMount {
  pub name: String,
  pub id: ObjectId,
  pub module: Arc<ModuleInfo>,
  /// Name of the device providing the filesystem.
  pub source: String,
  pub target: String,
  pub options: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedStep {
  pub id: ObjectId,
  pub module: Arc<ModuleInfo>,
  pub options: Value,
  pub inputs: Vec<ResolvedInput>,
  pub devices: Vec<ResolvedDevice>,
  pub mounts: Vec<ResolvedMount>,
}

impl ResolvedStep {
  pub fn kind(&self) -> &str {
    &self.module.name
  }
}

#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
  pub name: String,
  /// Identifier of the last step, or the empty-tree identifier.
  pub id: ObjectId,
  pub build: Option<PipelineRef>,
  pub source_epoch: Option<u64>,
  pub steps: Vec<ResolvedStep>,
}

impl ResolvedPipeline {
  /// Names of pipelines this one needs built first, in first-use order.
  pub fn dependencies(&self) -> Vec<&str> {
    let build = self.build.iter().map(|b| b.name.as_str());
    let inputs = self
      .steps
      .iter()
      .flat_map(|s| &s.inputs)
      .flat_map(|i| &i.refs)
      .filter(|r| r.pipeline.is_some())
      .map(|r| r.reference.as_str());

    let mut deps = Vec::new();
    for name in build.chain(inputs) {
      if !deps.contains(&name) {
        deps.push(name);
      }
    }
    deps
  }
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
  pub kind: String,
  pub module: Arc<ModuleInfo>,
  pub items: BTreeMap<String, Value>,
  pub options: Value,
}

/// A validated manifest with identifiers for every pipeline and step.
#[derive(Debug)]
pub struct ResolvedManifest {
  pub pipelines: Vec<ResolvedPipeline>,
  pub sources: Vec<ResolvedSource>,
  pub dag: PipelineDag,
}

impl ResolvedManifest {
  pub fn pipeline(&self, name: &str) -> Option<&ResolvedPipeline> {
    self.pipelines.iter().find(|p| p.name == name)
  }

  /// Every pipeline and step identifier in the manifest.
  pub fn all_ids(&self) -> BTreeSet<ObjectId> {
    let mut ids = BTreeSet::new();
    for pipeline in &self.pipelines {
      ids.insert(pipeline.id.clone());
      ids.extend(pipeline.steps.iter().map(|s| s.id.clone()));
    }
    ids
  }

  /// Find the pipeline and step index a step identifier belongs to.
  pub fn find_step(&self, id: &ObjectId) -> Option<(&ResolvedPipeline, usize)> {
    self
      .pipelines
      .iter()
      .find_map(|p| p.steps.iter().position(|s| &s.id == id).map(|i| (p, i)))
  }
}

impl fmt::Display for ResolvedManifest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for pipeline in &self.pipelines {
      writeln!(f, "{} {}", pipeline.id, pipeline.name)?;
      for step in &pipeline.steps {
        writeln!(f, "  {} {}", step.id, step.kind())?;
      }
    }
    Ok(())
  }
}

// Identity records. These are the exact documents hashed into identifiers.

#[derive(Serialize)]
pub(crate) struct StepIdentity<'a> {
  #[serde(rename = "type")]
  pub kind: &'a str,
  pub options: &'a Value,
  pub build: Option<&'a ObjectId>,
  pub base: Option<&'a ObjectId>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_epoch: Option<u64>,
  pub inputs: BTreeMap<&'a str, &'a ObjectId>,
  pub devices: Vec<(&'a str, &'a ObjectId)>,
  pub mounts: Vec<(&'a str, &'a ObjectId)>,
}

impl Hashable for StepIdentity<'_> {}

#[derive(Serialize)]
pub(crate) struct InputIdentity<'a> {
  #[serde(rename = "type")]
  pub kind: &'a str,
  pub origin: InputOrigin,
  pub refs: Vec<(&'a str, &'a Value)>,
  pub options: &'a Value,
}

impl Hashable for InputIdentity<'_> {}

#[derive(Serialize)]
pub(crate) struct DeviceIdentity<'a> {
  #[serde(rename = "type")]
  pub kind: &'a str,
  pub options: &'a Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent: Option<&'a ObjectId>,
}

impl Hashable for DeviceIdentity<'_> {}

#[derive(Serialize)]
pub(crate) struct MountIdentity<'a> {
  #[serde(rename = "type")]
  pub kind: &'a str,
  pub source: &'a ObjectId,
  pub target: &'a str,
  pub options: &'a Value,
}

impl Hashable for MountIdentity<'_> {}
