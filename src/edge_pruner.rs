//! Edge pruner
//!
//! Every source vertex's raw output is cached as it is produced; every
//! destination input is then rebuilt from the cache as a masked sum over its
//! incoming edges, with no normalization:
//!
//! ```text
//! input(dst, slot) = sum_e  c_e * cache[src_e] + (1 - c_e) * constant[src_e]
//! ```
//!
//! Cache hooks must be installed before pruning hooks, and the cache is reset
//! at the start of every pass.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::ablation::AblationConstants;
use crate::cache::EdgeActivationCache;
use crate::error::{PruneError, Result};
use crate::eval::kl_loss;
use crate::graph::{GraphDescriptor, PruningMode, VertexId};
use crate::hooks::{check_point, HookAction, HookPoint, HookRegistry};
use crate::model::{check_architecture, run_graph, run_unhooked, ComponentModel};
use crate::pruner::{check_sampler_len, mask_mean, MaskedPass, PrunedOutput, Pruner};
use crate::sampler::MaskSampler;

/// Prunes individual edges of the computation graph
pub struct EdgePruner<'m, M: ComponentModel + ?Sized> {
    model: &'m M,
    graph: Arc<GraphDescriptor>,
    sampler: Box<dyn MaskSampler>,
    constants: AblationConstants,
    registry: HookRegistry,
    cache: EdgeActivationCache,
    ablatable: Vec<bool>,
}

impl<'m, M: ComponentModel + ?Sized> EdgePruner<'m, M> {
    /// Pair a model with an edge sampler and per-source constants
    pub fn new(
        model: &'m M,
        graph: Arc<GraphDescriptor>,
        sampler: Box<dyn MaskSampler>,
        constants: AblationConstants,
    ) -> Result<Self> {
        check_architecture(model, &graph)?;
        check_sampler_len(&graph, PruningMode::Edge, sampler.as_ref())?;
        let ablatable = constants.require_for(&graph, PruningMode::Edge, sampler.as_ref())?;
        let cache = EdgeActivationCache::with_capacity(graph.n_vertices());
        Ok(Self {
            model,
            graph,
            sampler,
            constants,
            registry: HookRegistry::new(),
            cache,
            ablatable,
        })
    }

    /// Cache the raw output of every vertex with outgoing edges
    pub fn add_cache_hooks(&mut self) -> Result<()> {
        self.registry.remove_where(|a| matches!(a, HookAction::CacheOutput));
        for (vertex, _) in self.graph.source_groups() {
            let point = HookPoint::Output(vertex);
            check_point(&self.graph, &point)?;
            self.registry.add(point, HookAction::CacheOutput);
        }
        info!("Installed {} edge cache hooks", self.registry.len());
        Ok(())
    }

    fn has_cache_hooks(&self) -> bool {
        self.registry
            .has_action(|a| matches!(a, HookAction::CacheOutput))
    }

    fn has_pruning_hooks(&self) -> bool {
        self.registry
            .has_action(|a| matches!(a, HookAction::ReconstructInput))
    }

    /// Clear the activation cache; runs at the start of every pass
    pub fn setup_inference(&mut self) {
        self.cache.reset();
    }

    /// Vertices cached by the most recent pass
    pub fn cached_vertices(&self) -> &[VertexId] {
        self.cache.cached_vertices()
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Pruned pass plus KL divergence from the unpruned network.
    ///
    /// Returns the pass and the task loss; the training objective is
    /// `kl + mask_loss`.
    pub fn forward_with_kl(&mut self, input: &Tensor) -> Result<(PrunedOutput, Tensor)> {
        let pruned = self.forward(input)?;
        let baseline = self.forward_unpruned(input)?;
        let kl = kl_loss(&pruned.output, &baseline)?;
        Ok((pruned, kl))
    }
}

impl<M: ComponentModel + ?Sized> Pruner for EdgePruner<'_, M> {
    fn mode(&self) -> PruningMode {
        PruningMode::Edge
    }

    fn graph(&self) -> &GraphDescriptor {
        &self.graph
    }

    fn add_pruning_hooks(&mut self) -> Result<()> {
        if !self.has_cache_hooks() {
            return Err(PruneError::HookOrder(
                "add_cache_hooks must run before add_pruning_hooks".into(),
            ));
        }
        self.ablatable =
            self.constants
                .require_for(&self.graph, PruningMode::Edge, self.sampler.as_ref())?;
        self.registry.remove_where(|a| matches!(a, HookAction::ReconstructInput));

        let mut installed = 0;
        for &vertex in self.graph.vertices() {
            for &slot in vertex.input_slots() {
                let point = HookPoint::Input(vertex, slot);
                check_point(&self.graph, &point)?;
                self.registry.add(point, HookAction::ReconstructInput);
                installed += 1;
            }
        }
        info!("Installed {installed} edge pruning hooks");
        Ok(())
    }

    fn remove_hooks(&mut self) {
        self.registry.clear();
        self.cache.reset();
    }

    fn forward(&mut self, input: &Tensor) -> Result<PrunedOutput> {
        if !self.has_pruning_hooks() {
            return Err(PruneError::HookOrder(
                "forward called before add_pruning_hooks".into(),
            ));
        }
        self.setup_inference();
        let mask = self.sampler.sample()?;
        let mask_loss = self.sampler.regularization_loss()?;

        let mut hooks = MaskedPass::new(
            &self.graph,
            &self.registry,
            &mask,
            &self.ablatable,
            &self.constants,
        )
        .with_cache(&mut self.cache);
        let output = run_graph(self.model, &self.graph, input, &mut hooks)?;
        debug!(
            "Edge pass: mask mean {:.4}, {} vertices cached",
            mask_mean(&mask)?,
            self.cache.len()
        );

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
        check_sampler_len(&self.graph, PruningMode::Edge, sampler.as_ref())?;
        self.ablatable = self
            .constants
            .require_for(&self.graph, PruningMode::Edge, sampler.as_ref())?;
        Ok(std::mem::replace(&mut self.sampler, sampler))
    }

    fn constants(&self) -> &AblationConstants {
        &self.constants
    }

    fn constants_mut(&mut self) -> &mut AblationConstants {
        &mut self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArchitectureConfig, EdgeId, InputSlot};
    use crate::model::VertexInputs;
    use crate::sampler::ConstantSampler;
    use crate::toy::ToyTransformer;
    use candle_core::{DType, Device};

    fn setup() -> (ToyTransformer, Arc<GraphDescriptor>, Tensor) {
        let device = Device::Cpu;
        let arch = ArchitectureConfig::new(2, 2);
        let model = ToyTransformer::random(arch.clone(), 6, 5, &device).unwrap();
        let graph = Arc::new(GraphDescriptor::new(arch).unwrap());
        let input = ToyTransformer::random_inputs(3, 6, 17, &device).unwrap();
        (model, graph, input)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn pruner_with_mask<'m>(
        model: &'m ToyTransformer,
        graph: &Arc<GraphDescriptor>,
        values: Vec<f32>,
    ) -> EdgePruner<'m, ToyTransformer> {
        let constants =
            AblationConstants::zeros(graph, PruningMode::Edge, 6, &Device::Cpu).unwrap();
        let sampler = ConstantSampler::from_values(values, &Device::Cpu).unwrap();
        let mut pruner =
            EdgePruner::new(model, graph.clone(), Box::new(sampler), constants).unwrap();
        pruner.add_cache_hooks().unwrap();
        pruner.add_pruning_hooks().unwrap();
        pruner
    }

    #[test]
    fn test_pruning_hooks_require_cache_hooks() {
        let (model, graph, _) = setup();
        let constants =
            AblationConstants::zeros(&graph, PruningMode::Edge, 6, &Device::Cpu).unwrap();
        let sampler = ConstantSampler::ones(graph.n_edges(), &Device::Cpu).unwrap();
        let mut pruner = EdgePruner::new(&model, graph, Box::new(sampler), constants).unwrap();
        assert!(matches!(
            pruner.add_pruning_hooks(),
            Err(PruneError::HookOrder(_))
        ));
    }

    #[test]
    fn test_all_ones_reproduces_unpruned() {
        let (model, graph, input) = setup();
        let mut pruner = pruner_with_mask(&model, &graph, vec![1.0; graph.n_edges()]);
        let pruned = pruner.forward(&input).unwrap();
        let unpruned = pruner.forward_unpruned(&input).unwrap();
        assert!(max_abs_diff(&pruned.output, &unpruned) < 1e-5);
        assert_eq!(pruner.cached_vertices().len(), graph.source_groups().len());
    }

    #[test]
    fn test_two_edge_reconstruction() {
        // attention-only, one layer, one head: output reads embed and a0.0
        let device = Device::Cpu;
        let arch = ArchitectureConfig::attention_only(1, 1);
        let model = ToyTransformer::random(arch.clone(), 6, 5, &device).unwrap();
        let graph = Arc::new(GraphDescriptor::new(arch).unwrap());
        let input = ToyTransformer::random_inputs(3, 6, 17, &device).unwrap();

        let (c1, c2) = (0.3f32, 0.8f32);
        let e1 = graph
            .edge_index(&EdgeId::new(VertexId::Embed, VertexId::Output, InputSlot::Residual))
            .unwrap();
        let e2 = graph
            .edge_index(&EdgeId::new(VertexId::attn(0, 0), VertexId::Output, InputSlot::Residual))
            .unwrap();
        let mut values = vec![1.0; graph.n_edges()];
        values[e1] = c1;
        values[e2] = c2;

        let mut pruner = pruner_with_mask(&model, &graph, values);
        let pruned = pruner.forward(&input).unwrap();

        // recompute v1 = embed, v2 = a0.0 on the unmasked inputs
        let v1 = model.embed(&input).unwrap();
        let mut inputs = VertexInputs::new();
        for &slot in VertexId::attn(0, 0).input_slots() {
            inputs.insert(slot, v1.clone());
        }
        let v2 = model.forward_vertex(VertexId::attn(0, 0), &inputs).unwrap();
        let residual = ((&v1 * c1 as f64).unwrap() + (&v2 * c2 as f64).unwrap()).unwrap();
        let expected = model.readout(&residual).unwrap();
        assert!(max_abs_diff(&pruned.output, &expected) < 1e-5);
    }

    #[test]
    fn test_cache_reset_every_pass() {
        let (model, graph, input) = setup();
        let mut pruner = pruner_with_mask(&model, &graph, vec![1.0; graph.n_edges()]);
        pruner.forward(&input).unwrap();
        let first = pruner.cached_vertices().len();
        let other = ToyTransformer::random_inputs(2, 6, 99, &Device::Cpu).unwrap();
        let out = pruner.forward(&other).unwrap();
        assert_eq!(pruner.cached_vertices().len(), first);
        assert_eq!(out.output.dims(), &[2, 6]);
    }

    #[test]
    fn test_forward_with_kl_is_zero_for_full_mask() {
        let (model, graph, input) = setup();
        let mut pruner = pruner_with_mask(&model, &graph, vec![1.0; graph.n_edges()]);
        let (_, kl) = pruner.forward_with_kl(&input).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().abs() < 1e-5);

        let mut pruner = pruner_with_mask(&model, &graph, vec![0.0; graph.n_edges()]);
        let (out, kl) = pruner.forward_with_kl(&input).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap() > 0.0);
        assert_eq!(out.mask.dtype(), DType::F32);
    }

    #[test]
    fn test_remove_hooks_disables_forward() {
        let (model, graph, input) = setup();
        let mut pruner = pruner_with_mask(&model, &graph, vec![1.0; graph.n_edges()]);
        pruner.remove_hooks();
        assert!(pruner.registry().is_empty());
        assert!(matches!(
            pruner.forward(&input),
            Err(PruneError::HookOrder(_))
        ));
    }
}
