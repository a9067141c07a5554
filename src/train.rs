//! Optimizer wiring for mask training
//!
//! Mask parameters and ablation constants are stepped by two AdamW
//! optimizers with their own learning rates (`lr`, `lr_constants`) and no
//! weight decay. Gradients are computed once per step and shared; NaN and
//! infinite entries are zeroed before either optimizer sees them. After each
//! step the sampler's NaN repair runs, and the size of the update to the
//! ablation constants is reported.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, warn};

use crate::config::PruningConfig;
use crate::error::Result;
use crate::pruner::{PrunedOutput, Pruner};

/// Losses and update size of one optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub task_loss: f32,
    pub mask_loss: f32,
    /// L2 norm of the change to the stacked ablation constants
    pub constants_step: f32,
}

impl StepReport {
    pub fn total(&self) -> f32 {
        self.task_loss + self.mask_loss
    }
}

pub struct PruningOptimizer {
    mask: AdamW,
    constants: AdamW,
    mask_vars: Vec<Var>,
    constant_vars: Vec<Var>,
    step: usize,
}

impl std::fmt::Debug for PruningOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PruningOptimizer")
            .field("mask_vars", &self.mask_vars.len())
            .field("constant_vars", &self.constant_vars.len())
            .field("step", &self.step)
            .finish()
    }
}

fn adamw(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    Ok(AdamW::new(vars, params)?)
}

fn stack_vars(vars: &[Var]) -> Result<Option<Tensor>> {
    if vars.is_empty() {
        return Ok(None);
    }
    let tensors: Vec<Tensor> = vars.iter().map(|v| v.as_tensor().detach()).collect();
    Ok(Some(Tensor::stack(&tensors, 0)?))
}

/// Replace NaN and infinite gradient entries of `vars` with zero.
///
/// Returns the number of entries replaced.
pub(crate) fn zero_non_finite(grads: &mut GradStore, vars: &[Var]) -> Result<usize> {
    let mut replaced = 0;
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()).cloned() else {
            continue;
        };
        // NaN and +-inf all fail `|g| < inf`
        let finite = grad.abs()?.lt(f32::INFINITY)?;
        let n_finite = finite.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as usize;
        let n_bad = grad.elem_count() - n_finite;
        if n_bad > 0 {
            let cleaned = finite.where_cond(&grad, &grad.zeros_like()?)?;
            grads.insert(var.as_tensor(), cleaned);
            replaced += n_bad;
        }
    }
    Ok(replaced)
}

impl PruningOptimizer {
    /// Collect the pruner's trainable variables.
    ///
    /// Variables are captured now: freezing the sampler or changing the
    /// constants' trainability afterwards needs a new optimizer.
    pub fn new<P: Pruner + ?Sized>(pruner: &P, config: &PruningConfig) -> Result<Self> {
        let mask_vars = pruner.sampler().trainable_vars();
        let constant_vars = pruner.constants().trainable_vars();
        debug!(
            "Optimizer over {} mask and {} constant variables",
            mask_vars.len(),
            constant_vars.len()
        );
        Ok(Self {
            mask: adamw(mask_vars.clone(), config.lr)?,
            constants: adamw(constant_vars.clone(), config.lr_constants)?,
            mask_vars,
            constant_vars,
            step: 0,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Backpropagate `task_loss + mask_loss` and update every variable
    pub fn step<P: Pruner + ?Sized>(
        &mut self,
        pruner: &mut P,
        pruned: &PrunedOutput,
        task_loss: &Tensor,
    ) -> Result<StepReport> {
        let loss = pruned.total_loss(task_loss)?;
        let before = stack_vars(&self.constant_vars)?;

        let mut grads = loss.backward()?;
        let replaced = zero_non_finite(&mut grads, &self.mask_vars)?
            + zero_non_finite(&mut grads, &self.constant_vars)?;
        if replaced > 0 {
            warn!("Zeroed {replaced} non-finite gradient entries at step {}", self.step + 1);
        }
        self.mask.step(&grads)?;
        self.constants.step(&grads)?;
        self.step += 1;

        if !pruner.sampler_mut().fix_nans()? {
            warn!("Mask parameters not finite after step {}", self.step);
        }

        let constants_step = match (before, stack_vars(&self.constant_vars)?) {
            (Some(before), Some(after)) => (after - before)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?,
            _ => 0.0,
        };
        let report = StepReport {
            step: self.step,
            task_loss: task_loss.to_scalar::<f32>()?,
            mask_loss: pruned.mask_loss.to_scalar::<f32>()?,
            constants_step,
        };
        debug!(
            "Step {}: task {:.5}, mask {:.5}, constants step {:.2e}",
            report.step, report.task_loss, report.mask_loss, report.constants_step
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ablation::AblationConstants;
    use crate::eval::kl_loss;
    use crate::graph::{ArchitectureConfig, GraphDescriptor, PruningMode};
    use crate::hard_concrete::HardConcreteSampler;
    use crate::pruner::VertexPruner;
    use crate::toy::ToyTransformer;
    use candle_core::Device;
    use std::sync::Arc;

    #[test]
    fn test_step_moves_parameters() {
        let arch = ArchitectureConfig::new(1, 2);
        let model = ToyTransformer::random(arch.clone(), 4, 3, &Device::Cpu).unwrap();
        let graph = Arc::new(GraphDescriptor::new(arch).unwrap());
        // low logits: most gates sample to exactly zero, so the constants learn
        let config = PruningConfig {
            init_logit: -6.0,
            ..PruningConfig::default()
        };
        let sampler = HardConcreteSampler::for_graph(&graph, PruningMode::Vertex, &config, &Device::Cpu).unwrap();
        let constants = AblationConstants::zeros(&graph, PruningMode::Vertex, 4, &Device::Cpu).unwrap();
        let mut pruner = VertexPruner::new(&model, graph, Box::new(sampler), constants).unwrap();
        pruner.add_pruning_hooks().unwrap();

        let mut optimizer = PruningOptimizer::new(&pruner, &config).unwrap();
        let before = pruner.sampler().parameters().unwrap();
        let x = ToyTransformer::random_inputs(8, 4, 0, &Device::Cpu).unwrap();

        let pruned = pruner.forward(&x).unwrap();
        let baseline = pruner.forward_unpruned(&x).unwrap();
        let task = kl_loss(&pruned.output, &baseline).unwrap();
        let report = optimizer.step(&mut pruner, &pruned, &task).unwrap();

        assert_eq!(report.step, 1);
        assert_eq!(optimizer.step_count(), 1);
        assert!(report.mask_loss > 0.0);
        assert!(report.constants_step > 0.0);
        assert_ne!(pruner.sampler().parameters().unwrap(), before);
    }

    #[test]
    fn test_frozen_constants_do_not_move() {
        let arch = ArchitectureConfig::new(1, 1);
        let model = ToyTransformer::random(arch.clone(), 4, 3, &Device::Cpu).unwrap();
        let graph = Arc::new(GraphDescriptor::new(arch).unwrap());
        let config = PruningConfig::default();
        let sampler = HardConcreteSampler::for_graph(&graph, PruningMode::Vertex, &config, &Device::Cpu).unwrap();
        let mut constants = AblationConstants::zeros(&graph, PruningMode::Vertex, 4, &Device::Cpu).unwrap();
        constants.set_trainable(false);
        let mut pruner = VertexPruner::new(&model, graph, Box::new(sampler), constants).unwrap();
        pruner.add_pruning_hooks().unwrap();

        let mut optimizer = PruningOptimizer::new(&pruner, &config).unwrap();
        let x = ToyTransformer::random_inputs(4, 4, 0, &Device::Cpu).unwrap();
        let pruned = pruner.forward(&x).unwrap();
        let baseline = pruner.forward_unpruned(&x).unwrap();
        let task = kl_loss(&pruned.output, &baseline).unwrap();
        let report = optimizer.step(&mut pruner, &pruned, &task).unwrap();
        assert_eq!(report.constants_step, 0.0);
    }

    #[test]
    fn test_zero_non_finite_gradients() {
        let var = Var::new(&[1.0f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let scale = Tensor::new(&[f32::NAN, 1.0, f32::INFINITY, f32::NEG_INFINITY], &Device::Cpu).unwrap();
        let loss = (var.as_tensor() * &scale).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let replaced = zero_non_finite(&mut grads, &[var.clone()]).unwrap();
        assert_eq!(replaced, 3);
        let g: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_loss_leaves_parameters_finite() {
        let arch = ArchitectureConfig::new(1, 2);
        let model = ToyTransformer::random(arch.clone(), 4, 3, &Device::Cpu).unwrap();
        let graph = Arc::new(GraphDescriptor::new(arch).unwrap());
        let config = PruningConfig::default();
        let sampler = HardConcreteSampler::for_graph(&graph, PruningMode::Vertex, &config, &Device::Cpu).unwrap();
        let constants = AblationConstants::zeros(&graph, PruningMode::Vertex, 4, &Device::Cpu).unwrap();
        let mut pruner = VertexPruner::new(&model, graph, Box::new(sampler), constants).unwrap();
        pruner.add_pruning_hooks().unwrap();

        let mut optimizer = PruningOptimizer::new(&pruner, &config).unwrap();
        let before = pruner.sampler().parameters().unwrap();
        let x = ToyTransformer::random_inputs(8, 4, 0, &Device::Cpu).unwrap();
        let pruned = pruner.forward(&x).unwrap();
        let baseline = pruner.forward_unpruned(&x).unwrap();
        let task = kl_loss(&pruned.output, &baseline).unwrap().affine(f64::NAN, 0.0).unwrap();
        optimizer.step(&mut pruner, &pruned, &task).unwrap();

        let after = pruner.sampler().parameters().unwrap();
        assert!(after.iter().flatten().all(|v| v.is_finite()));
        assert_eq!(after, before);
        let constants = pruner.constants().stacked().unwrap();
        let values: Vec<f32> = constants.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
