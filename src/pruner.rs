//! Pruners: sampled masks applied to a live forward pass
//!
//! A pruner owns a [`MaskSampler`] and an [`AblationConstants`] set and
//! borrows the network. `add_pruning_hooks` installs interception points;
//! each `forward` then draws exactly one mask from the sampler, before any
//! point fires, and every point computes
//!
//! ```text
//! c * live + (1 - c) * ablation_constant
//! ```
//!
//! The mask is broadcast over the batch. [`VertexPruner`] intercepts vertex
//! outputs; [`crate::edge_pruner::EdgePruner`] rebuilds vertex inputs from
//! cached outputs, one coefficient per edge.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Tensor, Var};
use tracing::{debug, info};

use crate::ablation::{constant_table, AblationConstants};
use crate::cache::EdgeActivationCache;
use crate::error::{PruneError, Result};
use crate::graph::{GraphDescriptor, InputSlot, PruningMode, VertexId};
use crate::hooks::{check_point, HookAction, HookPoint, HookRegistry, PassHooks};
use crate::model::{check_architecture, run_graph, run_unhooked, ComponentModel};
use crate::sampler::MaskSampler;

/// Result of one pruned forward pass
#[derive(Debug, Clone)]
pub struct PrunedOutput {
    /// Network readout under the sampled mask
    pub output: Tensor,
    /// Sampler regularization, kept apart from any task loss
    pub mask_loss: Tensor,
    /// The mask drawn for this pass, shape `(n_elements,)`
    pub mask: Tensor,
}

impl PrunedOutput {
    /// `task_loss + mask_loss`
    pub fn total_loss(&self, task_loss: &Tensor) -> Result<Tensor> {
        Ok((task_loss + &self.mask_loss)?)
    }
}

/// Capabilities shared by the vertex and edge pruners
pub trait Pruner {
    fn mode(&self) -> PruningMode;

    fn graph(&self) -> &GraphDescriptor;

    /// Install the interception points. Fails on a missing ablation constant.
    fn add_pruning_hooks(&mut self) -> Result<()>;

    /// Remove every installed hook
    fn remove_hooks(&mut self);

    /// Forward pass under one freshly sampled mask
    fn forward(&mut self, input: &Tensor) -> Result<PrunedOutput>;

    /// Forward pass with every hook disabled
    fn forward_unpruned(&self, input: &Tensor) -> Result<Tensor>;

    fn sampler(&self) -> &dyn MaskSampler;

    fn sampler_mut(&mut self) -> &mut dyn MaskSampler;

    /// Swap in another sampler, returning the previous one.
    ///
    /// Installed hooks are re-validated against the new sampler first; on
    /// error the old sampler stays in place.
    fn set_sampler(&mut self, sampler: Box<dyn MaskSampler>) -> Result<Box<dyn MaskSampler>>;

    fn constants(&self) -> &AblationConstants;

    fn constants_mut(&mut self) -> &mut AblationConstants;

    /// Sampler parameters followed by ablation constants
    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.sampler().trainable_vars();
        vars.extend(self.constants().trainable_vars());
        vars
    }
}

/// Reject a sampler whose size disagrees with the graph
pub(crate) fn check_sampler_len(
    graph: &GraphDescriptor,
    mode: PruningMode,
    sampler: &dyn MaskSampler,
) -> Result<()> {
    let expected = graph.n_elements(mode);
    if sampler.len() != expected {
        return Err(PruneError::ShapeMismatch {
            what: format!("{mode} mask"),
            expected,
            got: sampler.len(),
        });
    }
    Ok(())
}

/// Coefficients below this count as ablated when training constants
pub(crate) const ABLATED_BELOW: f32 = 1e-3;

/// Convex combination `c * live + (1 - c) * constant`, `c` of shape `(1,)`.
///
/// The constant only receives gradient when `c < ABLATED_BELOW`; for a
/// partially kept element it enters the pass detached.
pub(crate) fn blend(live: &Tensor, coefficient: &Tensor, constant: &Tensor) -> Result<Tensor> {
    let kept = live.broadcast_mul(coefficient)?;
    let ablated_gate = coefficient.lt(ABLATED_BELOW)?.to_dtype(constant.dtype())?;
    let gated = (constant.broadcast_mul(&ablated_gate)?
        + constant.detach().broadcast_mul(&ablated_gate.affine(-1.0, 1.0)?)?)?;
    let ablated = gated.broadcast_mul(&coefficient.affine(-1.0, 1.0)?)?;
    Ok(kept.broadcast_add(&ablated)?)
}

/// Hooks of one masked pass: the installed actions, the mask drawn for the
/// pass, and (edge mode) the activation cache
pub(crate) struct MaskedPass<'a> {
    pub graph: &'a GraphDescriptor,
    pub registry: &'a HookRegistry,
    pub mask: &'a Tensor,
    pub ablatable: &'a [bool],
    pub constants: HashMap<VertexId, Tensor>,
    pub cache: Option<&'a mut EdgeActivationCache>,
}

impl<'a> MaskedPass<'a> {
    pub fn new(
        graph: &'a GraphDescriptor,
        registry: &'a HookRegistry,
        mask: &'a Tensor,
        ablatable: &'a [bool],
        constants: &AblationConstants,
    ) -> Self {
        Self {
            graph,
            registry,
            mask,
            ablatable,
            constants: constant_table(constants),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a mut EdgeActivationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn coefficient(&self, element: usize) -> Result<Tensor> {
        Ok(self.mask.narrow(0, element, 1)?)
    }

    fn constant(&self, vertex: &VertexId) -> Result<&Tensor> {
        self.constants
            .get(vertex)
            .ok_or_else(|| PruneError::MissingAblationConstant(vertex.to_string()))
    }

    fn prune_output(&self, vertex: VertexId, element: usize, live: Tensor) -> Result<Tensor> {
        let c = self.coefficient(element)?;
        if !self.ablatable.get(element).copied().unwrap_or(true) {
            return Ok(live.broadcast_mul(&c)?);
        }
        blend(&live, &c, self.constant(&vertex)?)
    }

    /// Masked sum over the incoming edges of `vertex` at `slot`
    fn reconstruct(&self, vertex: VertexId, slot: InputSlot) -> Result<Tensor> {
        let cache = self.cache.as_deref().ok_or_else(|| {
            PruneError::HookOrder(format!("{vertex} input rebuilt without a cache"))
        })?;
        let mut total: Option<Tensor> = None;
        for &e in self.graph.incoming_edges(&vertex, slot) {
            let src = self.graph.edges()[e].src;
            let cached = cache.get(&src)?;
            let c = self.coefficient(e)?;
            let term = if self.ablatable.get(e).copied().unwrap_or(true) {
                blend(cached, &c, self.constant(&src)?)?
            } else {
                cached.broadcast_mul(&c)?
            };
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        total.ok_or_else(|| PruneError::UnknownVertex(format!("{vertex} has no incoming edges")))
    }
}

impl PassHooks for MaskedPass<'_> {
    fn on_input(&mut self, vertex: VertexId, slot: InputSlot, live: Tensor) -> Result<Tensor> {
        let registry = self.registry;
        let mut value = live;
        for action in registry.actions_at(&HookPoint::Input(vertex, slot)) {
            if let HookAction::ReconstructInput = action {
                value = self.reconstruct(vertex, slot)?;
            }
        }
        Ok(value)
    }

    fn on_output(&mut self, vertex: VertexId, output: Tensor) -> Result<Tensor> {
        let registry = self.registry;
        let mut value = output;
        for action in registry.actions_at(&HookPoint::Output(vertex)) {
            match *action {
                HookAction::CacheOutput => match self.cache.as_deref_mut() {
                    Some(cache) => cache.insert(vertex, value.clone()),
                    None => {
                        return Err(PruneError::HookOrder(format!(
                            "{vertex} cache hook without a cache"
                        )))
                    }
                },
                HookAction::PruneOutput { element } => {
                    value = self.prune_output(vertex, element, value)?;
                }
                HookAction::ReconstructInput => {}
            }
        }
        Ok(value)
    }
}

/// Mean coefficient of a mask, for logging
pub(crate) fn mask_mean(mask: &Tensor) -> Result<f32> {
    Ok(mask.mean_all()?.to_scalar::<f32>()?)
}

// ============================================================================
// Vertex pruner
// ============================================================================

/// Prunes attention heads and MLP blocks by intercepting their outputs
pub struct VertexPruner<'m, M: ComponentModel + ?Sized> {
    model: &'m M,
    graph: Arc<GraphDescriptor>,
    sampler: Box<dyn MaskSampler>,
    constants: AblationConstants,
    registry: HookRegistry,
    /// Which mask elements can fall below one, fixed at hook installation
    ablatable: Vec<bool>,
}

impl<'m, M: ComponentModel + ?Sized> VertexPruner<'m, M> {
    /// Pair a model with a vertex sampler and constants.
    ///
    /// Fails if the sampler size, model architecture or constants do not
    /// match the graph.
    pub fn new(
        model: &'m M,
        graph: Arc<GraphDescriptor>,
        sampler: Box<dyn MaskSampler>,
        constants: AblationConstants,
    ) -> Result<Self> {
        check_architecture(model, &graph)?;
        check_sampler_len(&graph, PruningMode::Vertex, sampler.as_ref())?;
        let ablatable = constants.require_for(&graph, PruningMode::Vertex, sampler.as_ref())?;
        Ok(Self {
            model,
            graph,
            sampler,
            constants,
            registry: HookRegistry::new(),
            ablatable,
        })
    }

    pub fn model(&self) -> &M {
        self.model
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }
}

impl<M: ComponentModel + ?Sized> Pruner for VertexPruner<'_, M> {
    fn mode(&self) -> PruningMode {
        PruningMode::Vertex
    }

    fn graph(&self) -> &GraphDescriptor {
        &self.graph
    }

    fn add_pruning_hooks(&mut self) -> Result<()> {
        self.ablatable =
            self.constants
                .require_for(&self.graph, PruningMode::Vertex, self.sampler.as_ref())?;
        self.registry.remove_where(|a| matches!(a, HookAction::PruneOutput { .. }));
        for (element, vertex) in self.graph.maskable_vertices().iter().enumerate() {
            let point = HookPoint::Output(*vertex);
            check_point(&self.graph, &point)?;
            self.registry.add(point, HookAction::PruneOutput { element });
        }
        info!("Installed {} vertex pruning hooks", self.registry.len());
        Ok(())
    }

    fn remove_hooks(&mut self) {
        self.registry.clear();
    }

    fn forward(&mut self, input: &Tensor) -> Result<PrunedOutput> {
        if !self
            .registry
            .has_action(|a| matches!(a, HookAction::PruneOutput { .. }))
        {
            return Err(PruneError::HookOrder(
                "forward called before add_pruning_hooks".into(),
            ));
        }
        let mask = self.sampler.sample()?;
        let mask_loss = self.sampler.regularization_loss()?;

        let mut hooks = MaskedPass::new(
            &self.graph,
            &self.registry,
            &mask,
            &self.ablatable,
            &self.constants,
        );
        let output = run_graph(self.model, &self.graph, input, &mut hooks)?;
        debug!("Vertex pass: mask mean {:.4}", mask_mean(&mask)?);

        Ok(PrunedOutput {
            output,
            mask_loss,
            mask,
        })
    }

    fn forward_unpruned(&self, input: &Tensor) -> Result<Tensor> {
        Ok(run_unhooked(self.model, &self.graph, input)?.detach())
    }

    fn sampler(&self) -> &dyn MaskSampler {
        self.sampler.as_ref()
    }

    fn sampler_mut(&mut self) -> &mut dyn MaskSampler {
        self.sampler.as_mut()
    }

    fn set_sampler(&mut self, sampler: Box<dyn MaskSampler>) -> Result<Box<dyn MaskSampler>> {
        check_sampler_len(&self.graph, PruningMode::Vertex, sampler.as_ref())?;
        self.ablatable = self
            .constants
            .require_for(&self.graph, PruningMode::Vertex, sampler.as_ref())?;
        Ok(std::mem::replace(&mut self.sampler, sampler))
    }

    fn constants(&self) -> &AblationConstants {
        &self.constants
    }

    fn constants_mut(&mut self) -> &mut AblationConstants {
        &mut self.constants
    }
}
