//! Evaluation of masks and circuits against the unpruned network
//!
//! Every comparison is KL(P || Q) with P the unpruned prediction and Q the
//! prediction under the mask, averaged over the batch.

use candle_core::{DType, Device, Tensor, D};
use tracing::{debug, info};

use crate::circuit::Circuit;
use crate::error::{PruneError, Result};
use crate::pruner::Pruner;
use crate::sampler::{ConstantSampler, MaskSampler, SingleComponentSampler};

/// Differentiable KL(baseline || pruned) over the last dimension, batch mean
pub fn kl_loss(pruned_logits: &Tensor, baseline_logits: &Tensor) -> Result<Tensor> {
    let log_q = candle_nn::ops::log_softmax(pruned_logits, D::Minus1)?;
    let log_p = candle_nn::ops::log_softmax(&baseline_logits.detach(), D::Minus1)?;
    let per_row = (log_p.exp()? * (log_p - log_q)?)?.sum(D::Minus1)?;
    Ok(per_row.mean_all()?)
}

/// Mean squared error, for regression-style readouts
pub fn mse_loss(pruned: &Tensor, baseline: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::mse(pruned, &baseline.detach())?)
}

/// KL divergence between two logit tensors, averaged over rows
///
/// KL(P || Q) where P = softmax(baseline), Q = softmax(ablated)
pub fn kl_divergence(baseline_logits: &Tensor, ablated_logits: &Tensor) -> Result<f32> {
    let p = softmax_rows(baseline_logits)?;
    let q = softmax_rows(ablated_logits)?;
    if p.is_empty() {
        return Ok(0.0);
    }

    let total: f32 = p
        .iter()
        .zip(q.iter())
        .map(|(p_row, q_row)| {
            p_row
                .iter()
                .zip(q_row.iter())
                .filter(|(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
                .map(|(&pi, &qi)| pi * (pi / qi).ln())
                .sum::<f32>()
        })
        .sum();

    Ok(total / p.len() as f32)
}

/// Convert logits to per-row probability distributions (softmax)
fn softmax_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let logits_f32 = logits.to_dtype(DType::F32)?;
    let logits_2d = match logits_f32.rank() {
        1 => logits_f32.unsqueeze(0)?,
        _ => logits_f32.flatten_to(logits_f32.rank() - 2)?,
    };
    let probs = candle_nn::ops::softmax_last_dim(&logits_2d)?;
    Ok(probs.to_vec2()?)
}

/// Size and loss of one evaluated circuit or mask
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitEvaluation {
    /// Number of vertices (vertex mode) or edges (edge mode)
    pub size: usize,
    /// Mean KL divergence from the unpruned network
    pub loss: f32,
}

/// Loss of the network with one component ablated
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentImportance {
    /// Vertex or edge id
    pub id: String,
    pub loss: f32,
}

fn batch_device(batches: &[Tensor]) -> Result<Device> {
    batches
        .first()
        .map(|b| b.device().clone())
        .ok_or_else(|| PruneError::Config("evaluation needs at least one batch".into()))
}

/// Run `f` with `sampler` installed, then put the previous sampler back
fn with_sampler<P, T>(
    pruner: &mut P,
    sampler: Box<dyn MaskSampler>,
    f: impl FnOnce(&mut P) -> Result<T>,
) -> Result<T>
where
    P: Pruner + ?Sized,
{
    let previous = pruner.set_sampler(sampler)?;
    let result = f(pruner);
    pruner.set_sampler(previous)?;
    result
}

/// Mean KL over batches with the pruner's current sampler
pub fn mean_kl<P: Pruner + ?Sized>(pruner: &mut P, batches: &[Tensor]) -> Result<f32> {
    if batches.is_empty() {
        return Err(PruneError::Config("evaluation needs at least one batch".into()));
    }
    let mut total = 0.0f32;
    for batch in batches {
        let pruned = pruner.forward(batch)?;
        let baseline = pruner.forward_unpruned(batch)?;
        total += kl_divergence(&baseline, &pruned.output)?;
    }
    Ok(total / batches.len() as f32)
}

/// Loss of a fixed mask, e.g. a resolved or discretized one
pub fn evaluate_mask<P: Pruner + ?Sized>(
    pruner: &mut P,
    mask: ConstantSampler,
    batches: &[Tensor],
) -> Result<f32> {
    with_sampler(pruner, Box::new(mask), |p| mean_kl(p, batches))
}

/// `(size, loss)` of a circuit: its elements kept, everything else ablated
pub fn evaluate_circuit<P: Pruner + ?Sized>(
    pruner: &mut P,
    circuit: &Circuit,
    batches: &[Tensor],
) -> Result<CircuitEvaluation> {
    let device = batch_device(batches)?;
    if circuit.mode != pruner.mode() {
        return Err(PruneError::Config(format!(
            "{} circuit evaluated with a {} pruner",
            circuit.mode,
            pruner.mode()
        )));
    }
    let mask = circuit.to_constant_sampler(pruner.graph(), &device)?;
    let loss = evaluate_mask(pruner, mask, batches)?;
    let evaluation = CircuitEvaluation {
        size: circuit.size(),
        loss,
    };
    info!(
        "Circuit evaluation: size {}, KL {:.5}",
        evaluation.size, evaluation.loss
    );
    Ok(evaluation)
}

/// Leave-one-out importance of every mask element
pub fn single_component_sweep<P: Pruner + ?Sized>(
    pruner: &mut P,
    batches: &[Tensor],
) -> Result<Vec<ComponentImportance>> {
    let device = batch_device(batches)?;
    let mode = pruner.mode();
    let ids = pruner.graph().element_ids(mode);
    let n = ids.len();

    let sampler = SingleComponentSampler::new(n, 0, &device)?;
    with_sampler(pruner, Box::new(sampler), |p| {
        let mut results = Vec::with_capacity(n);
        for (index, id) in ids.into_iter().enumerate() {
            let single = SingleComponentSampler::new(n, index, &device)?;
            p.set_sampler(Box::new(single))?;
            let loss = mean_kl(p, batches)?;
            debug!("Ablated {id}: KL {loss:.5}");
            results.push(ComponentImportance { id, loss });
        }
        Ok(results)
    })
}
