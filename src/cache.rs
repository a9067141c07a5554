//! Per-pass activation cache for edge pruning
//!
//! Edge pruning rebuilds every vertex input from the outputs of its sources,
//! so the raw output of each source vertex is stored as it is produced. The
//! cache only lives for one forward pass: [`EdgeActivationCache::reset`] runs
//! at the start of every pass, so a stale output from a previous batch can
//! never be read.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{PruneError, Result};
use crate::graph::VertexId;

/// Raw vertex outputs captured during the current pass
#[derive(Debug, Default)]
pub struct EdgeActivationCache {
    /// Output of each cached vertex, shape `(batch, d_model)`
    activations: HashMap<VertexId, Tensor>,
    /// Cache order, for diagnostics
    order: Vec<VertexId>,
}

impl EdgeActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache sized for `n_vertices`
    pub fn with_capacity(n_vertices: usize) -> Self {
        Self {
            activations: HashMap::with_capacity(n_vertices),
            order: Vec::with_capacity(n_vertices),
        }
    }

    /// Store a vertex output; a second store in the same pass replaces it
    pub fn insert(&mut self, vertex: VertexId, tensor: Tensor) {
        if self.activations.insert(vertex, tensor).is_none() {
            self.order.push(vertex);
        }
    }

    /// Output of `vertex` in the current pass
    pub fn get(&self, vertex: &VertexId) -> Result<&Tensor> {
        self.activations
            .get(vertex)
            .ok_or_else(|| PruneError::UncachedVertex(vertex.to_string()))
    }

    pub fn contains(&self, vertex: &VertexId) -> bool {
        self.activations.contains_key(vertex)
    }

    /// Drop everything cached so far
    pub fn reset(&mut self) {
        self.activations.clear();
        self.order.clear();
    }

    /// Cached vertices in the order they were produced
    pub fn cached_vertices(&self) -> &[VertexId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}
