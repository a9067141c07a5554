//! Circuit extraction
//!
//! A [`Circuit`] is the set of vertices (vertex mode) or edges (edge mode)
//! whose resolved coefficient lies strictly above a threshold, with dangling
//! edges removed. Circuits are values: every operation returns a new one.

use std::collections::BTreeSet;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PruneError, Result};
use crate::graph::{EdgeId, GraphDescriptor, PruningMode, VertexId};
use crate::sampler::ConstantSampler;

/// Materialized subgraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub mode: PruningMode,
    /// Kept vertices; in edge mode, the endpoints of kept edges
    pub vertices: BTreeSet<VertexId>,
    /// Kept edges; empty in vertex mode
    pub edges: BTreeSet<EdgeId>,
}

impl Circuit {
    /// Number of edges (edge mode) or maskable vertices (vertex mode)
    pub fn size(&self) -> usize {
        match self.mode {
            PruningMode::Vertex => self.vertices.iter().filter(|v| v.is_maskable()).count(),
            PruningMode::Edge => self.edges.len(),
        }
    }

    pub fn contains_vertex(&self, vertex: &VertexId) -> bool {
        self.vertices.contains(vertex)
    }

    pub fn contains_edge(&self, edge: &EdgeId) -> bool {
        self.edges.contains(edge)
    }

    /// 0/1 mask over the graph's elements: 1 for every element in the circuit
    pub fn to_mask(&self, graph: &GraphDescriptor) -> Vec<f32> {
        match self.mode {
            PruningMode::Vertex => graph
                .maskable_vertices()
                .iter()
                .map(|v| if self.vertices.contains(v) { 1.0 } else { 0.0 })
                .collect(),
            PruningMode::Edge => graph
                .edges()
                .iter()
                .map(|e| if self.edges.contains(e) { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    /// Wrap the circuit's 0/1 mask for evaluation
    pub fn to_constant_sampler(&self, graph: &GraphDescriptor, device: &Device) -> Result<ConstantSampler> {
        ConstantSampler::from_values(self.to_mask(graph), device)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Saved {} circuit of size {} to {}", self.mode, self.size(), path.display());
        Ok(())
    }

    /// Load a circuit and check it against `graph`
    pub fn load_json(path: impl AsRef<Path>, graph: &GraphDescriptor) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let circuit: Self = serde_json::from_str(&content)?;
        circuit.validate(graph)?;
        Ok(circuit)
    }

    /// Every vertex and edge must belong to `graph`; vertex circuits carry no edges
    pub fn validate(&self, graph: &GraphDescriptor) -> Result<()> {
        if let Some(v) = self.vertices.iter().find(|v| !graph.contains_vertex(v)) {
            return Err(PruneError::UnknownVertex(v.to_string()));
        }
        if let Some(e) = self.edges.iter().find(|e| !graph.contains_edge(e)) {
            return Err(PruneError::UnknownEdge(e.to_string()));
        }
        if self.mode == PruningMode::Vertex && !self.edges.is_empty() {
            return Err(PruneError::Config(format!(
                "vertex circuit lists {} edges",
                self.edges.len()
            )));
        }
        Ok(())
    }
}

/// Resolved mask as `f32` values, checking its length against the graph
pub fn mask_values(graph: &GraphDescriptor, mode: PruningMode, mask: &Tensor) -> Result<Vec<f32>> {
    let values: Vec<f32> = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let expected = graph.n_elements(mode);
    if values.len() != expected {
        return Err(PruneError::ShapeMismatch {
            what: format!("{mode} mask"),
            expected,
            got: values.len(),
        });
    }
    Ok(values)
}

/// Indices of the coefficients strictly above `threshold`
pub fn threshold_indices(values: &[f32], threshold: f64) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, &v)| f64::from(v) > threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Round a resolved mask to 0/1 at `threshold` (strict)
pub fn discretize(values: &[f32], threshold: f64) -> Vec<f32> {
    values
        .iter()
        .map(|&v| if f64::from(v) > threshold { 1.0 } else { 0.0 })
        .collect()
}

/// Threshold a resolved mask into a circuit.
///
/// Edge circuits are closed under dangling-edge removal; `excluded` lists
/// vertices pruned at the vertex level, which produce nothing.
pub fn mask_to_circuit(
    graph: &GraphDescriptor,
    mode: PruningMode,
    mask: &Tensor,
    threshold: f64,
    excluded: &BTreeSet<VertexId>,
) -> Result<Circuit> {
    let values = mask_values(graph, mode, mask)?;
    let selected = threshold_indices(&values, threshold);

    let circuit = match mode {
        PruningMode::Vertex => Circuit {
            mode,
            vertices: selected
                .iter()
                .map(|&i| graph.maskable_vertices()[i])
                .filter(|v| !excluded.contains(v))
                .collect(),
            edges: BTreeSet::new(),
        },
        PruningMode::Edge => {
            let edges: BTreeSet<EdgeId> = selected.iter().map(|&i| graph.edges()[i]).collect();
            let edges = prune_dangling_edges(graph, &edges, excluded);
            let vertices = edges.iter().flat_map(|e| [e.src, e.dst]).collect();
            Circuit {
                mode,
                vertices,
                edges,
            }
        }
    };
    info!(
        "Extracted {} circuit: {} of {} elements above {}",
        mode,
        circuit.size(),
        values.len(),
        threshold
    );
    Ok(circuit)
}

/// Remove edges that carry nothing, until no more can be removed.
///
/// A vertex produces something if it is the embedding, or has at least one
/// remaining incoming edge, and is not in `excluded`. A vertex is used if it
/// is the output or has at least one remaining outgoing edge. Edges from
/// non-producing sources or into unused destinations are removed. The result
/// is a fixed point, so applying it again changes nothing.
pub fn prune_dangling_edges(
    graph: &GraphDescriptor,
    edges: &BTreeSet<EdgeId>,
    excluded: &BTreeSet<VertexId>,
) -> BTreeSet<EdgeId> {
    let mut current: BTreeSet<EdgeId> = edges
        .iter()
        .copied()
        .filter(|e| graph.contains_edge(e))
        .collect();

    loop {
        let has_input: BTreeSet<VertexId> = current.iter().map(|e| e.dst).collect();
        let has_output: BTreeSet<VertexId> = current.iter().map(|e| e.src).collect();

        let produces = |v: &VertexId| {
            !excluded.contains(v) && (*v == VertexId::Embed || has_input.contains(v))
        };
        let used = |v: &VertexId| *v == VertexId::Output || has_output.contains(v);

        let next: BTreeSet<EdgeId> = current
            .iter()
            .copied()
            .filter(|e| produces(&e.src) && used(&e.dst))
            .collect();

        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}
