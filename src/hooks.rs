//! Interception points for pruned forward passes
//!
//! A [`HookPoint`] names a location in the graph traversal: the output of a
//! vertex, or one input slot of a vertex. A [`HookRegistry`] records which
//! [`HookAction`]s are installed at which points. The traversal in
//! [`crate::model::run_graph`] visits points in evaluation order and hands
//! each value to a [`PassHooks`] implementation, which runs the installed
//! actions.
//!
//! Point names follow the `TransformerLens` convention so logs read like the
//! hooks of a Python pruning run:
//!
//! ```text
//! hook_embed
//! blocks.1.attn.hook_result.0     (output of head a1.0)
//! blocks.1.hook_q_input.0         (query input of head a1.0)
//! blocks.1.hook_mlp_in / hook_mlp_out
//! hook_final_in                   (input of the readout)
//! ```

use std::collections::HashMap;
use std::fmt;

use candle_core::Tensor;

use crate::error::{PruneError, Result};
use crate::graph::{InputSlot, VertexId};

/// A location in the traversal where a value can be intercepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Raw output of a vertex
    Output(VertexId),
    /// Assembled input of a vertex at one slot
    Input(VertexId, InputSlot),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output(VertexId::Embed) => write!(f, "hook_embed"),
            Self::Output(VertexId::Attn { layer, head }) => {
                write!(f, "blocks.{layer}.attn.hook_result.{head}")
            }
            Self::Output(VertexId::Mlp { layer }) => write!(f, "blocks.{layer}.hook_mlp_out"),
            Self::Output(VertexId::Output) => write!(f, "hook_final_out"),
            Self::Input(VertexId::Attn { layer, head }, slot) => {
                let circ = match slot {
                    InputSlot::Query => "q",
                    InputSlot::Key => "k",
                    InputSlot::Value => "v",
                    InputSlot::Residual => "resid",
                };
                write!(f, "blocks.{layer}.hook_{circ}_input.{head}")
            }
            Self::Input(VertexId::Mlp { layer }, _) => write!(f, "blocks.{layer}.hook_mlp_in"),
            Self::Input(VertexId::Output, _) => write!(f, "hook_final_in"),
            Self::Input(VertexId::Embed, _) => write!(f, "hook_embed_in"),
        }
    }
}

/// What an installed hook does when its point is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookAction {
    /// Store the raw output in the per-pass activation cache
    CacheOutput,
    /// Replace the output by `c * live + (1 - c) * constant`
    PruneOutput { element: usize },
    /// Rebuild the input as a masked sum over incoming edges
    ReconstructInput,
}

/// Installed hooks, keyed by point, in installation order
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<HookAction>>,
    n_hooks: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an action at a point
    pub fn add(&mut self, point: HookPoint, action: HookAction) {
        self.hooks.entry(point).or_default().push(action);
        self.n_hooks += 1;
    }

    /// Actions installed at a point, in installation order
    pub fn actions_at(&self, point: &HookPoint) -> &[HookAction] {
        self.hooks.get(point).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any hook of the given kind is installed
    pub fn has_action(&self, matches: impl Fn(&HookAction) -> bool) -> bool {
        self.hooks.values().flatten().any(matches)
    }

    /// Remove every hook of the given kind
    pub fn remove_where(&mut self, matches: impl Fn(&HookAction) -> bool) {
        for actions in self.hooks.values_mut() {
            actions.retain(|a| !matches(a));
        }
        self.hooks.retain(|_, actions| !actions.is_empty());
        self.n_hooks = self.hooks.values().map(Vec::len).sum();
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
        self.n_hooks = 0;
    }

    pub fn len(&self) -> usize {
        self.n_hooks
    }

    pub fn is_empty(&self) -> bool {
        self.n_hooks == 0
    }
}

/// Callbacks the graph traversal invokes at every hook point
pub trait PassHooks {
    /// Called with the live input assembled for `vertex` at `slot`
    fn on_input(&mut self, vertex: VertexId, slot: InputSlot, live: Tensor) -> Result<Tensor>;

    /// Called with the raw output of `vertex`; the result is what downstream
    /// vertices read
    fn on_output(&mut self, vertex: VertexId, output: Tensor) -> Result<Tensor>;
}

/// Pass-through hooks: the unmodified network
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PassHooks for NoHooks {
    fn on_input(&mut self, _vertex: VertexId, _slot: InputSlot, live: Tensor) -> Result<Tensor> {
        Ok(live)
    }

    fn on_output(&mut self, _vertex: VertexId, output: Tensor) -> Result<Tensor> {
        Ok(output)
    }
}

/// Reject installing a hook at a point the graph does not have
pub(crate) fn check_point(graph: &crate::graph::GraphDescriptor, point: &HookPoint) -> Result<()> {
    match point {
        HookPoint::Output(v) => {
            if !graph.contains_vertex(v) {
                return Err(PruneError::UnknownVertex(v.to_string()));
            }
        }
        HookPoint::Input(v, slot) => {
            if !graph.contains_vertex(v) || !v.input_slots().contains(slot) {
                return Err(PruneError::UnknownVertex(point.to_string()));
            }
        }
    }
    Ok(())
}
