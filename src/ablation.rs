//! Optimal-ablation constants
//!
//! One learnable `(d_model,)` vector per source vertex. In vertex mode it
//! replaces the vertex's output; in edge mode it replaces the source's share
//! of every ablated outgoing edge. Constants are initialized from mean
//! activations (or zeros) and trained jointly with the mask, or alone
//! against a fixed mask.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor, Var};
use tracing::info;

use crate::cache::EdgeActivationCache;
use crate::error::{PruneError, Result};
use crate::graph::{GraphDescriptor, InputSlot, PruningMode, VertexId};
use crate::hooks::PassHooks;
use crate::model::{run_graph, ComponentModel};
use crate::sampler::MaskSampler;

/// Learnable ablation values keyed by vertex
#[derive(Debug, Clone)]
pub struct AblationConstants {
    constants: BTreeMap<VertexId, Var>,
    d_model: usize,
    trainable: bool,
    device: Device,
}

impl AblationConstants {
    /// Empty set of constants
    pub fn new(d_model: usize, device: &Device) -> Self {
        Self {
            constants: BTreeMap::new(),
            d_model,
            trainable: true,
            device: device.clone(),
        }
    }

    /// Vertices that need a constant to ablate any element in `mode`
    pub fn sources(graph: &GraphDescriptor, mode: PruningMode) -> Vec<VertexId> {
        match mode {
            PruningMode::Vertex => graph.maskable_vertices().to_vec(),
            PruningMode::Edge => graph.source_groups().into_iter().map(|(v, _)| v).collect(),
        }
    }

    /// Zero constants for every source of `mode`
    pub fn zeros(graph: &GraphDescriptor, mode: PruningMode, d_model: usize, device: &Device) -> Result<Self> {
        let mut constants = Self::new(d_model, device);
        for vertex in Self::sources(graph, mode) {
            constants.insert(vertex, &vec![0.0; d_model])?;
        }
        Ok(constants)
    }

    /// Constants initialized to each source's mean output over a batch
    pub fn from_means<M: ComponentModel + ?Sized>(
        model: &M,
        graph: &GraphDescriptor,
        mode: PruningMode,
        input: &Tensor,
    ) -> Result<Self> {
        let mut recorder = OutputRecorder {
            cache: EdgeActivationCache::with_capacity(graph.n_vertices()),
        };
        run_graph(model, graph, input, &mut recorder)?;

        let d_model = model.d_model();
        let mut constants = Self::new(d_model, model.device());
        for vertex in Self::sources(graph, mode) {
            let mean: Vec<f32> = recorder
                .cache
                .get(&vertex)?
                .to_dtype(DType::F32)?
                .mean(0)?
                .to_vec1()?;
            constants.insert(vertex, &mean)?;
        }
        info!(
            "Initialized {} ablation constants from batch means",
            constants.len()
        );
        Ok(constants)
    }

    /// Set or replace the constant of `vertex`
    pub fn insert(&mut self, vertex: VertexId, values: &[f32]) -> Result<()> {
        if values.len() != self.d_model {
            return Err(PruneError::ShapeMismatch {
                what: format!("ablation constant for {vertex}"),
                expected: self.d_model,
                got: values.len(),
            });
        }
        let tensor = Tensor::from_slice(values, self.d_model, &self.device)?;
        match self.constants.get(&vertex) {
            Some(var) => var.set(&tensor)?,
            None => {
                self.constants.insert(vertex, Var::from_tensor(&tensor)?);
            }
        }
        Ok(())
    }

    pub fn contains(&self, vertex: &VertexId) -> bool {
        self.constants.contains_key(vertex)
    }

    /// Effective ablation value of `vertex`, shape `(d_model,)`
    pub fn resolve(&self, vertex: &VertexId) -> Result<Tensor> {
        self.constants
            .get(vertex)
            .map(|var| var.as_tensor().clone())
            .ok_or_else(|| PruneError::MissingAblationConstant(vertex.to_string()))
    }

    /// All constants stacked in vertex order, shape `(n, d_model)`
    pub fn stacked(&self) -> Result<Tensor> {
        let rows: Vec<Tensor> = self
            .constants
            .values()
            .map(|var| var.as_tensor().clone())
            .collect();
        if rows.is_empty() {
            return Ok(Tensor::zeros((0, self.d_model), DType::F32, &self.device)?);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// Vertices with a constant, in vertex order
    pub fn vertices(&self) -> Vec<VertexId> {
        self.constants.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Stop (or resume) handing constants to the optimizer
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.trainable {
            self.constants.values().cloned().collect()
        } else {
            Vec::new()
        }
    }

    /// Fail unless every element the sampler can ablate has a constant
    pub fn require_for(
        &self,
        graph: &GraphDescriptor,
        mode: PruningMode,
        sampler: &dyn MaskSampler,
    ) -> Result<Vec<bool>> {
        let mut ablatable = Vec::with_capacity(sampler.len());
        for index in 0..sampler.len() {
            let can = sampler.can_ablate(index);
            if can {
                let source = graph.element_source(mode, index)?;
                if !self.contains(&source) {
                    return Err(PruneError::MissingAblationConstant(source.to_string()));
                }
            }
            ablatable.push(can);
        }
        Ok(ablatable)
    }

    /// Constants as id-keyed vectors, for checkpoints
    pub fn to_map(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        self.constants
            .iter()
            .map(|(v, var)| Ok((v.to_string(), var.as_tensor().to_vec1()?)))
            .collect()
    }

    /// Validate an id-keyed map without applying it
    pub fn check_map(&self, graph: &GraphDescriptor, map: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        for (id, values) in map {
            let vertex: VertexId = id.parse()?;
            if !graph.contains_vertex(&vertex) {
                return Err(PruneError::UnknownVertex(id.clone()));
            }
            if values.len() != self.d_model {
                return Err(PruneError::ShapeMismatch {
                    what: format!("ablation constant for {id}"),
                    expected: self.d_model,
                    got: values.len(),
                });
            }
        }
        Ok(())
    }

    /// Apply an id-keyed map; validates everything before changing anything
    pub fn load_map(&mut self, graph: &GraphDescriptor, map: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        self.check_map(graph, map)?;
        for (id, values) in map {
            self.insert(id.parse()?, values)?;
        }
        Ok(())
    }
}

/// Records every raw vertex output of one pass
struct OutputRecorder {
    cache: EdgeActivationCache,
}

impl PassHooks for OutputRecorder {
    fn on_input(&mut self, _vertex: VertexId, _slot: InputSlot, live: Tensor) -> Result<Tensor> {
        Ok(live)
    }

    fn on_output(&mut self, vertex: VertexId, output: Tensor) -> Result<Tensor> {
        self.cache.insert(vertex, output.clone());
        Ok(output)
    }
}

/// Per-vertex lookup used by the pruners' hot path
pub(crate) fn constant_table(constants: &AblationConstants) -> HashMap<VertexId, Tensor> {
    constants
        .constants
        .iter()
        .map(|(v, var)| (*v, var.as_tensor().clone()))
        .collect()
}
