//! Network seam and graph traversal
//!
//! The network itself is opaque: anything that can embed a batch, evaluate
//! one head or MLP block from its assembled inputs, and read out the final
//! residual stream implements [`ComponentModel`]. [`run_graph`] walks the
//! graph in evaluation order, assembles each vertex input as the sum of its
//! upstream outputs and gives a [`PassHooks`] implementation the chance to
//! rewrite every input and output along the way.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use tracing::info;

use crate::error::{PruneError, Result};
use crate::graph::{ArchitectureConfig, GraphDescriptor, InputSlot, VertexId};
use crate::hooks::{NoHooks, PassHooks};

/// Unified backend trait for networks that can be pruned.
///
/// Implementing this trait is the only requirement for pruning a new model.
/// All tensors are `(batch, d_model)` except the readout, whose width is the
/// model's choice.
pub trait ComponentModel {
    fn architecture(&self) -> &ArchitectureConfig;
    fn d_model(&self) -> usize;
    fn device(&self) -> &Device;

    /// Embedding of a batch, the output of the `embed` vertex
    fn embed(&self, input: &Tensor) -> Result<Tensor>;

    /// Residual-stream contribution of one attention head or MLP block
    fn forward_vertex(&self, vertex: VertexId, inputs: &VertexInputs) -> Result<Tensor>;

    /// Final prediction from the assembled output input
    fn readout(&self, residual: &Tensor) -> Result<Tensor>;
}

/// Assembled inputs of one vertex, one tensor per input slot
#[derive(Debug, Clone, Default)]
pub struct VertexInputs {
    slots: Vec<(InputSlot, Tensor)>,
}

impl VertexInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: InputSlot, tensor: Tensor) {
        self.slots.retain(|(s, _)| *s != slot);
        self.slots.push((slot, tensor));
    }

    pub fn get(&self, slot: InputSlot) -> Result<&Tensor> {
        self.slots
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, t)| t)
            .ok_or_else(|| PruneError::HookOrder(format!("input slot {slot:?} was not assembled")))
    }

    pub fn query(&self) -> Result<&Tensor> {
        self.get(InputSlot::Query)
    }

    pub fn key(&self) -> Result<&Tensor> {
        self.get(InputSlot::Key)
    }

    pub fn value(&self) -> Result<&Tensor> {
        self.get(InputSlot::Value)
    }

    pub fn residual(&self) -> Result<&Tensor> {
        self.get(InputSlot::Residual)
    }
}

/// Select the compute device (tries CUDA, falls back to CPU)
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Reject a model whose architecture differs from the graph's
pub fn check_architecture<M: ComponentModel + ?Sized>(model: &M, graph: &GraphDescriptor) -> Result<()> {
    if model.architecture() != graph.architecture() {
        return Err(PruneError::ArchitectureMismatch {
            expected: graph.architecture().to_string(),
            found: model.architecture().to_string(),
        });
    }
    Ok(())
}

/// One forward pass in evaluation order, intercepted by `hooks`.
///
/// Each vertex input is the sum of the (hooked) outputs of its upstream
/// vertices. Returns the readout.
pub fn run_graph<M: ComponentModel + ?Sized>(
    model: &M,
    graph: &GraphDescriptor,
    input: &Tensor,
    hooks: &mut dyn PassHooks,
) -> Result<Tensor> {
    let mut outputs: HashMap<VertexId, Tensor> = HashMap::with_capacity(graph.n_vertices());

    for &vertex in graph.vertices() {
        if vertex == VertexId::Embed {
            let raw = model.embed(input)?;
            outputs.insert(vertex, hooks.on_output(vertex, raw)?);
            continue;
        }

        let mut inputs = VertexInputs::new();
        for &slot in vertex.input_slots() {
            let live = sum_upstream(graph, &outputs, &vertex)?;
            inputs.insert(slot, hooks.on_input(vertex, slot, live)?);
        }

        if vertex == VertexId::Output {
            return model.readout(inputs.residual()?);
        }

        let raw = model.forward_vertex(vertex, &inputs)?;
        outputs.insert(vertex, hooks.on_output(vertex, raw)?);
    }

    Err(PruneError::UnknownVertex(VertexId::Output.to_string()))
}

/// Unmodified forward pass
pub fn run_unhooked<M: ComponentModel + ?Sized>(
    model: &M,
    graph: &GraphDescriptor,
    input: &Tensor,
) -> Result<Tensor> {
    run_graph(model, graph, input, &mut NoHooks)
}

fn sum_upstream(
    graph: &GraphDescriptor,
    outputs: &HashMap<VertexId, Tensor>,
    vertex: &VertexId,
) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for src in graph.upstream(vertex)? {
        let out = outputs
            .get(src)
            .ok_or_else(|| PruneError::UncachedVertex(src.to_string()))?;
        total = Some(match total {
            Some(acc) => (acc + out)?,
            None => out.clone(),
        });
    }
    total.ok_or_else(|| PruneError::UnknownVertex(format!("{vertex} has no upstream vertices")))
}
