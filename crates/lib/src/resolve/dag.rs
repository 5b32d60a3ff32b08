//! Pipeline dependency graph.
//!
//! Edges run from a dependency to its dependent and come from two places: a
//! pipeline's `build` reference and `origin: pipeline` input references. The
//! graph provides:
//! - cycle verification
//! - the export subgraph in dependency order
//! - dependency queries and parallel waves for inspection

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use super::types::ResolvedPipeline;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
  #[error("pipeline dependency cycle involving '{0}'")]
  CycleDetected(String),

  #[error("unknown pipeline '{0}'")]
  UnknownPipeline(String),
}

#[derive(Debug)]
pub struct PipelineDag {
  /// Node weights are pipeline names.
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl PipelineDag {
  /// Build the graph over resolved pipelines.
  ///
  /// Dependencies naming pipelines that are not in the list are skipped; the
  /// resolver reports those separately.
  pub fn from_pipelines(pipelines: &[ResolvedPipeline]) -> Result<Self, DagError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for pipeline in pipelines {
      if !nodes.contains_key(&pipeline.name) {
        let idx = graph.add_node(pipeline.name.clone());
        nodes.insert(pipeline.name.clone(), idx);
      }
    }

    for pipeline in pipelines {
      let dependent_idx = nodes[&pipeline.name];
      for dep in pipeline.dependencies() {
        if let Some(&dep_idx) = nodes.get(dep) {
          graph.update_edge(dep_idx, dependent_idx, ());
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), DagError> {
    toposort(&self.graph, None).map_err(|cycle| DagError::CycleDetected(self.graph[cycle.node_id()].clone()))?;
    Ok(())
  }

  fn index(&self, name: &str) -> Result<NodeIndex, DagError> {
    self
      .nodes
      .get(name)
      .copied()
      .ok_or_else(|| DagError::UnknownPipeline(name.to_string()))
  }

  fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
    let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
    neighbors.sort();
    neighbors
  }

  /// The pipelines needed to produce `exports`, dependencies first.
  ///
  /// Pipelines not reachable backwards from an export are left out. Ties are
  /// broken by manifest order so the result is deterministic.
  pub fn required(&self, exports: &[String]) -> Result<Vec<String>, DagError> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for export in exports {
      let idx = self.index(export)?;
      self.visit(idx, &mut visited, &mut order);
    }
    Ok(order.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }

  fn visit(&self, idx: NodeIndex, visited: &mut HashSet<NodeIndex>, order: &mut Vec<NodeIndex>) {
    if !visited.insert(idx) {
      return;
    }
    for dep in self.sorted_neighbors(idx, Direction::Incoming) {
      self.visit(dep, visited, order);
    }
    order.push(idx);
  }

  /// Direct dependencies of a pipeline.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    let Ok(idx) = self.index(name) else {
      return Vec::new();
    };
    self
      .sorted_neighbors(idx, Direction::Incoming)
      .into_iter()
      .map(|i| self.graph[i].clone())
      .collect()
  }

  /// Pipelines that directly depend on `name`.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    let Ok(idx) = self.index(name) else {
      return Vec::new();
    };
    self
      .sorted_neighbors(idx, Direction::Outgoing)
      .into_iter()
      .map(|i| self.graph[i].clone())
      .collect()
  }

  pub fn pipeline_count(&self) -> usize {
    self.nodes.len()
  }

  /// Group pipelines into waves whose members depend only on earlier waves.
  pub fn waves(&self) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[idx] == 0).copied().collect();
      if ready.is_empty() {
        // unreachable for a verified graph
        break;
      }
      remaining.retain(|idx| !ready.contains(idx));
      for &idx in &ready {
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      waves.push(ready.into_iter().map(|idx| self.graph[idx].clone()).collect());
    }

    waves
  }
}
