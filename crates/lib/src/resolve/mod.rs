//! Manifest resolution.
//!
//! Resolution turns a parsed [`Manifest`] into a [`ResolvedManifest`]:
//! - every module type is looked up in the [`ModuleRegistry`] and its options
//!   checked against the module schema
//! - every reference (pipelines, source items, devices) is checked
//! - identifiers are computed for every input, device, mount, step and
//!   pipeline
//! - the pipeline dependency graph is built and verified acyclic
//!
//! Pipelines are walked in manifest order, so a pipeline may only reference
//! pipelines declared before it. All problems are collected and returned
//! together; nothing is executed for a manifest that fails to resolve.
//!
//! A step identifier is the hash of its type, options, build pipeline id,
//! previous step id (the Merkle chain), source epoch and the ids of its
//! inputs, devices and mounts. See [`crate::util::hash::Hashable`] for the
//! canonical encoding.

pub mod dag;
mod types;

pub use types::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::consts::MANIFEST_VERSION;
use crate::manifest::{
  DeviceDesc, InputDesc, InputOrigin, Manifest, MountDesc, PipelineDesc, StageDesc, pipeline_ref_name,
};
use crate::modules::schema::{self, ValidationIssue};
use crate::modules::{Builtin, FILES_CONTENT_TYPE, ModuleImpl, ModuleInfo, ModuleKind, ModuleRegistry};
use crate::util::hash::{Checksum, Hashable, ObjectId};

use dag::PipelineDag;

/// Resolve a manifest against a module registry.
pub fn resolve(manifest: &Manifest, registry: &ModuleRegistry) -> Result<ResolvedManifest, ValidationError> {
  let mut resolver = Resolver {
    registry,
    issues: Vec::new(),
    declared: HashMap::new(),
    source_items: HashSet::new(),
  };

  if manifest.version != MANIFEST_VERSION {
    resolver.issue(
      "/version",
      format!("unsupported manifest version '{}', expected '{MANIFEST_VERSION}'", manifest.version),
    );
  }

  let sources = resolver.sources(manifest);
  let pipelines: Vec<ResolvedPipeline> = manifest
    .pipelines
    .iter()
    .enumerate()
    .map(|(i, p)| resolver.pipeline(i, p))
    .collect();

  if !resolver.issues.is_empty() {
    return Err(ValidationError {
      issues: resolver.issues,
    });
  }

  let dag = PipelineDag::from_pipelines(&pipelines).map_err(|e| ValidationError::single("/pipelines", e.to_string()))?;

  debug!(pipelines = pipelines.len(), sources = sources.len(), "manifest resolved");

  Ok(ResolvedManifest { pipelines, sources, dag })
}

struct Resolver<'a> {
  registry: &'a ModuleRegistry,
  issues: Vec<ValidationIssue>,
  /// Pipelines declared so far, by name.
  declared: HashMap<String, ObjectId>,
  /// Every item key declared by any source.
  source_items: HashSet<String>,
}

impl Resolver<'_> {
  fn issue(&mut self, path: impl Into<String>, message: impl Into<String>) {
    self.issues.push(ValidationIssue::new(path, message));
  }

  fn module(&mut self, kind: ModuleKind, name: &str, path: String) -> Option<Arc<ModuleInfo>> {
    match self.registry.lookup(kind, name) {
      Ok(info) => Some(info),
      Err(e) => {
        self.issue(path, e.to_string());
        None
      }
    }
  }

  fn id_of(&mut self, path: &str, identity: &impl Hashable) -> ObjectId {
    identity.compute_id().unwrap_or_else(|e| {
      self.issue(path, format!("cannot compute identifier: {e}"));
      ObjectId::empty_tree()
    })
  }

  /// Look up a pipeline reference, which must name an earlier pipeline.
  fn pipeline_ref(&mut self, reference: &str, current: &str, path: String) -> Option<PipelineRef> {
    let name = pipeline_ref_name(reference);
    if name == current {
      self.issue(path, format!("pipeline '{name}' cannot depend on itself"));
      return None;
    }
    match self.declared.get(name) {
      Some(id) => Some(PipelineRef {
        name: name.to_string(),
        id: id.clone(),
      }),
      None => {
        self.issue(path, format!("unknown pipeline '{name}'"));
        None
      }
    }
  }

  fn sources(&mut self, manifest: &Manifest) -> Vec<ResolvedSource> {
    let mut resolved = Vec::new();

    for (kind, desc) in &manifest.sources {
      let path = format!("/sources/{kind}");
      let Some(module) = self.module(ModuleKind::Source, kind, path.clone()) else {
        continue;
      };
      module.validate_options(&desc.options, &format!("{path}/options"), &mut self.issues);

      for (key, item) in &desc.items {
        let item_path = format!("{path}/items/{key}");
        if module.meta.content_type() == FILES_CONTENT_TYPE
          && let Err(e) = key.parse::<Checksum>()
        {
          self.issue(item_path.clone(), e.to_string());
        }
        if let Some(item_schema) = &module.meta.item_schema {
          schema::validate(item_schema, item, &item_path, &mut self.issues);
        }
        self.source_items.insert(key.clone());
      }

      resolved.push(ResolvedSource {
        kind: kind.clone(),
        module,
        items: desc.items.clone(),
        options: desc.options.clone(),
      });
    }

    resolved
  }

  fn pipeline(&mut self, index: usize, desc: &PipelineDesc) -> ResolvedPipeline {
    let path = format!("/pipelines/{index}");

    if desc.name.is_empty() {
      self.issue(format!("{path}/name"), "pipeline name must not be empty");
    } else if self.declared.contains_key(&desc.name) {
      self.issue(format!("{path}/name"), format!("duplicate pipeline name '{}'", desc.name));
    }

    let build = desc
      .build
      .as_deref()
      .and_then(|b| self.pipeline_ref(b, &desc.name, format!("{path}/build")));

    let mut steps: Vec<ResolvedStep> = Vec::with_capacity(desc.stages.len());
    for (i, stage) in desc.stages.iter().enumerate() {
      let base = steps.last().map(|s| s.id.clone());
      let step_path = format!("{path}/stages/{i}");
      if let Some(step) = self.step(&step_path, &desc.name, stage, build.as_ref(), base, desc.source_epoch) {
        steps.push(step);
      }
    }

    let id = steps.last().map(|s| s.id.clone()).unwrap_or_else(ObjectId::empty_tree);
    self.declared.entry(desc.name.clone()).or_insert_with(|| id.clone());

    ResolvedPipeline {
      name: desc.name.clone(),
      id,
      build,
      source_epoch: desc.source_epoch,
      steps,
    }
  }

  fn step(
    &mut self,
    path: &str,
    pipeline: &str,
    stage: &StageDesc,
    build: Option<&PipelineRef>,
    base: Option<ObjectId>,
    source_epoch: Option<u64>,
  ) -> Option<ResolvedStep> {
    let module = self.module(ModuleKind::Step, &stage.kind, format!("{path}/type"));
    if let Some(module) = &module {
      module.validate_options(&stage.options, &format!("{path}/options"), &mut self.issues);
    }

    let inputs: Vec<ResolvedInput> = stage
      .inputs
      .iter()
      .filter_map(|(name, input)| self.input(&format!("{path}/inputs/{name}"), pipeline, name, input))
      .collect();
    let devices = self.devices(path, &stage.devices);
    let mounts = self.mounts(path, &stage.mounts, &devices);

    let module = module?;
    let identity = StepIdentity {
      kind: &stage.kind,
      options: &stage.options,
      build: build.map(|b| &b.id),
      base: base.as_ref(),
      source_epoch,
      inputs: inputs.iter().map(|i| (i.name.as_str(), &i.id)).collect(),
      devices: devices.iter().map(|d| (d.name.as_str(), &d.id)).collect(),
      mounts: mounts.iter().map(|m| (m.name.as_str(), &m.id)).collect(),
    };
    let id = self.id_of(path, &identity);

    Some(ResolvedStep {
      id,
      module,
      options: stage.options.clone(),
      inputs,
      devices,
      mounts,
    })
  }

  fn input(&mut self, path: &str, pipeline: &str, name: &str, desc: &InputDesc) -> Option<ResolvedInput> {
    let module = self.module(ModuleKind::Input, &desc.kind, format!("{path}/type"));
    if let Some(module) = &module {
      module.validate_options(&desc.options, &format!("{path}/options"), &mut self.issues);
    }

    if desc.references.is_empty() {
      self.issue(format!("{path}/references"), "input has no references");
    }

    let mut refs = Vec::new();
    for (reference, options) in desc.references.entries() {
      let ref_path = format!("{path}/references/{reference}");
      match desc.origin {
        InputOrigin::Pipeline => {
          if let Some(target) = self.pipeline_ref(&reference, pipeline, ref_path) {
            refs.push(InputRef {
              reference: target.name,
              pipeline: Some(target.id),
              options,
            });
          }
        }
        InputOrigin::Source => {
          if !self.source_items.contains(&reference) {
            self.issue(ref_path, format!("unknown source item '{reference}'"));
            continue;
          }
          refs.push(InputRef {
            reference,
            pipeline: None,
            options,
          });
        }
      }
    }

    let module = module?;
    match (&module.implementation, desc.origin) {
      (ModuleImpl::Builtin(Builtin::TreeInput), InputOrigin::Source) => {
        self.issue(format!("{path}/origin"), "tree inputs take pipeline references");
      }
      (ModuleImpl::Builtin(Builtin::TreeInput), InputOrigin::Pipeline) if refs.len() > 1 => {
        self.issue(format!("{path}/references"), "tree inputs take exactly one pipeline");
      }
      (ModuleImpl::Builtin(Builtin::FilesInput), InputOrigin::Pipeline) => {
        self.issue(format!("{path}/origin"), "files inputs take source references");
      }
      _ => {}
    }

    let identity = InputIdentity {
      kind: &desc.kind,
      origin: desc.origin,
      refs: refs.iter().map(|r| (r.identity_key(), &r.options)).collect(),
      options: &desc.options,
    };
    let id = self.id_of(path, &identity);

    Some(ResolvedInput {
      name: name.to_string(),
      id,
      module,
      origin: desc.origin,
      refs,
      options: desc.options.clone(),
    })
  }

  fn devices(&mut self, path: &str, descs: &[DeviceDesc]) -> Vec<ResolvedDevice> {
    let mut devices: Vec<ResolvedDevice> = Vec::with_capacity(descs.len());

    for (i, desc) in descs.iter().enumerate() {
      let dev_path = format!("{path}/devices/{i}");
      if devices.iter().any(|d| d.name == desc.name) {
        self.issue(format!("{dev_path}/name"), format!("duplicate device name '{}'", desc.name));
        continue;
      }

      let parent_id = match &desc.parent {
        Some(parent) => match devices.iter().find(|d| &d.name == parent) {
          Some(d) => Some(d.id.clone()),
          None => {
            self.issue(format!("{dev_path}/parent"), format!("unknown device '{parent}'"));
            continue;
          }
        },
        None => None,
      };

      let Some(module) = self.module(ModuleKind::Device, &desc.kind, format!("{dev_path}/type")) else {
        continue;
      };
      module.validate_options(&desc.options, &format!("{dev_path}/options"), &mut self.issues);

      let identity = DeviceIdentity {
        kind: &desc.kind,
        options: &desc.options,
        parent: parent_id.as_ref(),
      };
      let id = self.id_of(&dev_path, &identity);

      devices.push(ResolvedDevice {
        name: desc.name.clone(),
        id,
        module,
        parent: desc.parent.clone(),
        options: desc.options.clone(),
      });
    }

    devices
  }

  fn mounts(&mut self, path: &str, descs: &[MountDesc], devices: &[ResolvedDevice]) -> Vec<ResolvedMount> {
    let mut mounts: Vec<ResolvedMount> = Vec::with_capacity(descs.len());

    for (i, desc) in descs.iter().enumerate() {
      let mount_path = format!("{path}/mounts/{i}");
      if mounts.iter().any(|m| m.name == desc.name) {
        self.issue(format!("{mount_path}/name"), format!("duplicate mount name '{}'", desc.name));
        continue;
      }
      if !desc.target.starts_with('/') || desc.target.split('/').any(|c| c == "..") {
        self.issue(
          format!("{mount_path}/target"),
          format!("mount target '{}' must be an absolute path without '..'", desc.target),
        );
        continue;
      }
      let Some(device) = devices.iter().find(|d| d.name == desc.source) else {
        self.issue(format!("{mount_path}/source"), format!("unknown device '{}'", desc.source));
        continue;
      };

      let Some(module) = self.module(ModuleKind::Mount, &desc.kind, format!("{mount_path}/type")) else {
        continue;
      };
      module.validate_options(&desc.options, &format!("{mount_path}/options"), &mut self.issues);

      let identity = MountIdentity {
        kind: &desc.kind,
        source: &device.id,
        target: &desc.target,
        options: &desc.options,
      };
      let id = self.id_of(&mount_path, &identity);

      mounts.push(ResolvedMount {
        name: desc.name.clone(),
        id,
        module,
        source: desc.source.clone(),
        target: desc.target.clone(),
        options: desc.options.clone(),
      });
    }

    mounts
  }
}
