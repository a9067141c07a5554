//! Small deterministic transformer for tests and the demo
//!
//! Single-position "attention": head `h` of layer `l` computes
//!
//! ```text
//! gate = sigmoid(<q W_q, k W_k> / sqrt(d))      (batch, 1)
//! out  = scale * gate * (v W_v)
//! ```
//!
//! and each MLP block is `scale * relu(x W_in) W_out`. The readout is a
//! linear unembedding of the final residual. Weights come from a seeded
//! [`StdRng`], so two models built with the same seed are identical.

use std::collections::HashMap;

use candle_core::{Device, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{PruneError, Result};
use crate::graph::{ArchitectureConfig, VertexId};
use crate::model::{ComponentModel, VertexInputs};

#[derive(Debug, Clone)]
struct ToyHead {
    w_q: Tensor,
    w_k: Tensor,
    w_v: Tensor,
}

#[derive(Debug, Clone)]
struct ToyMlp {
    w_in: Tensor,
    w_out: Tensor,
}

/// Toy transformer implementing [`ComponentModel`]
#[derive(Debug, Clone)]
pub struct ToyTransformer {
    arch: ArchitectureConfig,
    d_model: usize,
    w_embed: Tensor,
    heads: HashMap<VertexId, ToyHead>,
    mlps: HashMap<VertexId, ToyMlp>,
    w_unembed: Tensor,
    scales: HashMap<VertexId, f64>,
    device: Device,
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let bound = (3.0 / rows as f64).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound) as f32)
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

impl ToyTransformer {
    /// Random weights for `arch` with residual width `d_model`
    pub fn random(arch: ArchitectureConfig, d_model: usize, seed: u64, device: &Device) -> Result<Self> {
        if d_model == 0 {
            return Err(PruneError::Config("d_model must be positive".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let w_embed = random_matrix(&mut rng, d_model, d_model, device)?;

        let mut heads = HashMap::new();
        let mut mlps = HashMap::new();
        for layer in 0..arch.n_layers {
            for head in 0..arch.n_heads {
                heads.insert(
                    VertexId::attn(layer, head),
                    ToyHead {
                        w_q: random_matrix(&mut rng, d_model, d_model, device)?,
                        w_k: random_matrix(&mut rng, d_model, d_model, device)?,
                        w_v: random_matrix(&mut rng, d_model, d_model, device)?,
                    },
                );
            }
            if arch.has_mlp(layer) {
                mlps.insert(
                    VertexId::mlp(layer),
                    ToyMlp {
                        w_in: random_matrix(&mut rng, d_model, 2 * d_model, device)?,
                        w_out: random_matrix(&mut rng, 2 * d_model, d_model, device)?,
                    },
                );
            }
        }
        let w_unembed = random_matrix(&mut rng, d_model, d_model, device)?;

        Ok(Self {
            arch,
            d_model,
            w_embed,
            heads,
            mlps,
            w_unembed,
            scales: HashMap::new(),
            device: device.clone(),
        })
    }

    /// Multiply one vertex's output by `scale`; zero silences it
    pub fn with_scale(mut self, vertex: VertexId, scale: f64) -> Self {
        self.scales.insert(vertex, scale);
        self
    }

    /// Silence every head and MLP except `keep`
    pub fn only(mut self, keep: &[VertexId]) -> Self {
        let silenced: Vec<VertexId> = self
            .heads
            .keys()
            .chain(self.mlps.keys())
            .copied()
            .filter(|v| !keep.contains(v))
            .collect();
        for vertex in silenced {
            self.scales.insert(vertex, 0.0);
        }
        self
    }

    /// Seeded uniform inputs of shape `(batch, d_model)`
    pub fn random_inputs(batch: usize, d_model: usize, seed: u64, device: &Device) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..batch * d_model)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        Ok(Tensor::from_vec(data, (batch, d_model), device)?)
    }

    fn scale(&self, vertex: &VertexId) -> f64 {
        self.scales.get(vertex).copied().unwrap_or(1.0)
    }
}

impl ComponentModel for ToyTransformer {
    fn architecture(&self) -> &ArchitectureConfig {
        &self.arch
    }

    fn d_model(&self) -> usize {
        self.d_model
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embed(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.matmul(&self.w_embed)?)
    }

    fn forward_vertex(&self, vertex: VertexId, inputs: &VertexInputs) -> Result<Tensor> {
        let scale = self.scale(&vertex);
        match vertex {
            VertexId::Attn { .. } => {
                let head = self
                    .heads
                    .get(&vertex)
                    .ok_or_else(|| PruneError::UnknownVertex(vertex.to_string()))?;
                let q = inputs.query()?.matmul(&head.w_q)?;
                let k = inputs.key()?.matmul(&head.w_k)?;
                let v = inputs.value()?.matmul(&head.w_v)?;
                let score = ((q * k)?.sum_keepdim(D::Minus1)? / (self.d_model as f64).sqrt())?;
                let gate = candle_nn::ops::sigmoid(&score)?;
                Ok((v.broadcast_mul(&gate)? * scale)?)
            }
            VertexId::Mlp { .. } => {
                let mlp = self
                    .mlps
                    .get(&vertex)
                    .ok_or_else(|| PruneError::UnknownVertex(vertex.to_string()))?;
                let hidden = inputs.residual()?.matmul(&mlp.w_in)?.relu()?;
                Ok((hidden.matmul(&mlp.w_out)? * scale)?)
            }
            VertexId::Embed | VertexId::Output => Err(PruneError::UnknownVertex(format!(
                "{vertex} is not a computation vertex"
            ))),
        }
    }

    fn readout(&self, residual: &Tensor) -> Result<Tensor> {
        Ok(residual.matmul(&self.w_unembed)?)
    }
}
