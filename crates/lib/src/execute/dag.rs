//! Image dependency graph.
//!
//! An image depends on its `base` image and on the image each of its layers
//! is built with. Edges run from dependency to dependent, so a node's
//! incoming neighbors must finish before it can start.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::manifest::{Image, ManifestError};

pub struct ImageGraph {
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl ImageGraph {
  /// Build the graph for `images`.
  ///
  /// # Errors
  ///
  /// Returns `UnknownImage` if a reference names an image not in `images`,
  /// and `Cycle` if the dependencies are not acyclic.
  pub fn new(images: &[Image]) -> Result<Self, ManifestError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for image in images {
      let idx = graph.add_node(image.id.clone());
      nodes.insert(image.id.clone(), idx);
    }

    for image in images {
      let dependent = nodes[&image.id];
      for dep in image.dependencies() {
        let &dependency = nodes.get(dep).ok_or_else(|| ManifestError::UnknownImage {
          image: image.id.clone(),
          reference: dep.to_string(),
        })?;
        graph.update_edge(dependency, dependent, ());
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), ManifestError> {
    toposort(&self.graph, None).map_err(|cycle| ManifestError::Cycle(self.graph[cycle.node_id()].clone()))?;
    Ok(())
  }

  /// Image IDs ordered so dependencies come before dependents.
  pub fn topological_order(&self) -> Vec<&str> {
    toposort(&self.graph, None)
      .map(|sorted| sorted.into_iter().map(|idx| self.graph[idx].as_str()).collect())
      .unwrap_or_default()
  }

  /// Direct dependencies of `id`.
  pub fn dependencies(&self, id: &str) -> Vec<&str> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Images that directly depend on `id`.
  pub fn dependents(&self, id: &str) -> Vec<&str> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    let mut ids: Vec<&str> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].as_str())
      .collect();
    ids.sort_unstable();
    ids
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}
