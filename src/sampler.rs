//! Mask sampler capability contract
//!
//! Every sampler owns one coefficient per mask element (a maskable vertex or
//! an edge, see [`crate::graph::PruningMode`]). A pruner calls
//! [`MaskSampler::sample`] exactly once per forward pass and broadcasts the
//! resulting `(n_elements,)` tensor across the batch.
//!
//! ## Sampler family
//!
//! - [`crate::hard_concrete::HardConcreteSampler`]: learnable logit per element,
//!   stretched-and-clamped concrete relaxation
//! - [`crate::uniform_window::UniformWindowSampler`]: learnable threshold per
//!   element, uniform window around it
//! - [`ConstantSampler`]: a fixed mask, e.g. a resolved or discretized one
//! - [`SingleComponentSampler`]: all ones except one element at zero
//!
//! Learnable samplers start in [`SamplerMode::Training`] and move to
//! [`SamplerMode::Frozen`] once, when the caller says so. A frozen sampler
//! emits its resolved mask with no noise.

use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{PruneError, Result};

/// Lifecycle of a learnable sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerMode {
    /// Stochastic samples, parameters receive gradients
    Training,
    /// Deterministic resolved mask, no trainable parameters
    Frozen,
}

impl fmt::Display for SamplerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "training"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

/// Shared capability set of all mask samplers
pub trait MaskSampler: fmt::Debug {
    /// Short name stored in checkpoints (`"hcgs"`, `"ugs"`, ...)
    fn kind(&self) -> &'static str;

    /// Number of mask elements
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Draw one mask of shape `(n_elements,)`, every value in `[0, 1]`
    fn sample(&mut self) -> Result<Tensor>;

    /// Scalar sparsity penalty on the current parameters
    fn regularization_loss(&self) -> Result<Tensor>;

    /// Deterministic mask the learned distribution resolves to
    fn resolve(&self) -> Result<Tensor>;

    /// Whether element `index` can take a coefficient below one.
    ///
    /// Pruners require an ablation constant for every element that can.
    fn can_ablate(&self, index: usize) -> bool {
        index < self.len()
    }

    /// Parameters the optimizer should update
    fn trainable_vars(&self) -> Vec<Var> {
        Vec::new()
    }

    fn mode(&self) -> SamplerMode {
        SamplerMode::Frozen
    }

    /// Switch from training to frozen. Has no effect on an already frozen sampler.
    fn freeze(&mut self) {}

    /// Repair parameters a bad optimizer step left non-finite.
    ///
    /// Returns whether every parameter is finite afterwards.
    fn fix_nans(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Per-element parameter vectors, in mask order, for checkpoints
    fn parameters(&self) -> Result<Vec<Vec<f32>>> {
        Ok(Vec::new())
    }

    /// Width of each per-element parameter vector
    fn parameter_width(&self) -> usize {
        0
    }

    /// Overwrite parameters from per-element vectors. On error nothing is changed.
    fn load_parameters(&mut self, params: &[Vec<f32>]) -> Result<()> {
        check_parameter_shape(params, self.len(), self.parameter_width())
    }
}

/// Fail unless every coefficient is finite and inside `[0, 1]`
pub fn check_unit_interval(mask: &Tensor, what: &str) -> Result<()> {
    let values: Vec<f32> = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    if let Some((i, v)) = values
        .iter()
        .enumerate()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        return Err(PruneError::NumericInstability(format!(
            "{what} coefficient {i} is {v}"
        )));
    }
    Ok(())
}

/// Logistic noise `ln(u) - ln(1 - u)` with `u` uniform in the open unit interval
pub(crate) fn logistic_noise(rng: &mut StdRng, n: usize, device: &Device) -> Result<Tensor> {
    let noise: Vec<f32> = (0..n)
        .map(|_| {
            let u: f64 = rng.gen_range(1e-6..1.0 - 1e-6);
            (u.ln() - (1.0 - u).ln()) as f32
        })
        .collect();
    Ok(Tensor::from_vec(noise, n, device)?)
}

/// Uniform noise in `[0, 1)`
pub(crate) fn uniform_noise(rng: &mut StdRng, n: usize, device: &Device) -> Result<Tensor> {
    let noise: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::from_vec(noise, n, device)?)
}

/// Transpose per-parameter columns into per-element rows
pub(crate) fn columns_to_rows(columns: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let n = columns.first().map_or(0, Vec::len);
    (0..n)
        .map(|i| columns.iter().map(|col| col[i]).collect())
        .collect()
}

pub(crate) fn check_parameter_shape(params: &[Vec<f32>], n: usize, width: usize) -> Result<()> {
    if params.len() != n {
        return Err(PruneError::ShapeMismatch {
            what: "sampler parameters".into(),
            expected: n,
            got: params.len(),
        });
    }
    if let Some(row) = params.iter().find(|row| row.len() != width) {
        return Err(PruneError::ShapeMismatch {
            what: "parameter vector width".into(),
            expected: width,
            got: row.len(),
        });
    }
    if params.iter().flatten().any(|v| !v.is_finite()) {
        return Err(PruneError::NumericInstability(
            "non-finite sampler parameter".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Fixed samplers
// ============================================================================

/// Wraps a fixed mask; `sample` returns it unchanged
#[derive(Debug, Clone)]
pub struct ConstantSampler {
    mask: Tensor,
    values: Vec<f32>,
}

impl ConstantSampler {
    /// Wrap a `(n_elements,)` mask. Values outside `[0, 1]` are rejected.
    pub fn new(mask: Tensor) -> Result<Self> {
        let mask = mask.flatten_all()?.to_dtype(DType::F32)?.detach();
        check_unit_interval(&mask, "constant mask")?;
        let values = mask.to_vec1()?;
        Ok(Self { mask, values })
    }

    pub fn from_values(values: Vec<f32>, device: &Device) -> Result<Self> {
        let n = values.len();
        Self::new(Tensor::from_vec(values, n, device)?)
    }

    /// All-ones mask: the unmodified network
    pub fn ones(n: usize, device: &Device) -> Result<Self> {
        Self::new(Tensor::ones(n, DType::F32, device)?)
    }

    /// All-zeros mask: every element ablated
    pub fn zeros(n: usize, device: &Device) -> Result<Self> {
        Self::new(Tensor::zeros(n, DType::F32, device)?)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

impl MaskSampler for ConstantSampler {
    fn kind(&self) -> &'static str {
        "constant"
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn sample(&mut self) -> Result<Tensor> {
        Ok(self.mask.clone())
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        Ok(Tensor::new(0f32, self.mask.device())?)
    }

    fn resolve(&self) -> Result<Tensor> {
        Ok(self.mask.clone())
    }

    fn can_ablate(&self, index: usize) -> bool {
        self.values.get(index).is_some_and(|&v| v < 1.0)
    }

    fn parameters(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.values.iter().map(|&v| vec![v]).collect())
    }

    fn parameter_width(&self) -> usize {
        1
    }

    fn load_parameters(&mut self, params: &[Vec<f32>]) -> Result<()> {
        check_parameter_shape(params, self.len(), 1)?;
        let values: Vec<f32> = params.iter().map(|row| row[0]).collect();
        *self = Self::from_values(values, self.mask.device())?;
        Ok(())
    }
}

/// Leave-one-out mask: all ones except `component`, which is exactly zero
#[derive(Debug, Clone)]
pub struct SingleComponentSampler {
    n: usize,
    component: usize,
    device: Device,
}

impl SingleComponentSampler {
    pub fn new(n: usize, component: usize, device: &Device) -> Result<Self> {
        if component >= n {
            return Err(PruneError::ShapeMismatch {
                what: "ablated component index".into(),
                expected: n,
                got: component,
            });
        }
        Ok(Self {
            n,
            component,
            device: device.clone(),
        })
    }

    pub fn component(&self) -> usize {
        self.component
    }

    /// Move the ablated element
    pub fn set_component(&mut self, component: usize) -> Result<()> {
        if component >= self.n {
            return Err(PruneError::ShapeMismatch {
                what: "ablated component index".into(),
                expected: self.n,
                got: component,
            });
        }
        self.component = component;
        Ok(())
    }

    fn mask(&self) -> Result<Tensor> {
        let mut values = vec![1f32; self.n];
        values[self.component] = 0.0;
        Ok(Tensor::from_vec(values, self.n, &self.device)?)
    }
}

impl MaskSampler for SingleComponentSampler {
    fn kind(&self) -> &'static str {
        "single"
    }

    fn len(&self) -> usize {
        self.n
    }

    fn sample(&mut self) -> Result<Tensor> {
        self.mask()
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        Ok(Tensor::new(0f32, &self.device)?)
    }

    fn resolve(&self) -> Result<Tensor> {
        self.mask()
    }

    fn can_ablate(&self, index: usize) -> bool {
        index == self.component
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_constant_sampler_is_idempotent() {
        let device = Device::Cpu;
        let mut sampler = ConstantSampler::from_values(vec![0.0, 0.25, 1.0], &device).unwrap();
        let a: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        assert_eq!(a, vec![0.0, 0.25, 1.0]);
        assert_eq!(a, b);

        let loss: f32 = sampler.regularization_loss().unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);
        assert!(sampler.trainable_vars().is_empty());
        assert_eq!(sampler.mode(), SamplerMode::Frozen);
    }

    #[test]
    fn test_constant_sampler_ablation_flags() {
        let sampler = ConstantSampler::from_values(vec![1.0, 0.5, 0.0], &Device::Cpu).unwrap();
        assert!(!sampler.can_ablate(0));
        assert!(sampler.can_ablate(1));
        assert!(sampler.can_ablate(2));
        assert!(!sampler.can_ablate(3));
    }

    #[test]
    fn test_constant_sampler_rejects_out_of_range() {
        assert!(matches!(
            ConstantSampler::from_values(vec![0.5, 1.5], &Device::Cpu),
            Err(PruneError::NumericInstability(_))
        ));
        assert!(ConstantSampler::from_values(vec![f32::NAN], &Device::Cpu).is_err());
    }

    #[test]
    fn test_constant_sampler_load_parameters() {
        let mut sampler = ConstantSampler::ones(2, &Device::Cpu).unwrap();
        sampler.load_parameters(&[vec![0.0], vec![1.0]]).unwrap();
        assert_eq!(sampler.values(), &[0.0, 1.0]);
        assert!(sampler.load_parameters(&[vec![0.0]]).is_err());
        assert_eq!(sampler.values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_single_component_sampler() {
        let device = Device::Cpu;
        let mut sampler = SingleComponentSampler::new(4, 2, &device).unwrap();
        let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        assert_eq!(mask, vec![1.0, 1.0, 0.0, 1.0]);
        assert!(sampler.can_ablate(2));
        assert!(!sampler.can_ablate(0));

        sampler.set_component(0).unwrap();
        let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        assert_eq!(mask, vec![0.0, 1.0, 1.0, 1.0]);

        assert!(sampler.set_component(4).is_err());
        assert!(SingleComponentSampler::new(3, 3, &device).is_err());
    }

    #[test]
    fn test_noise_ranges() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(0);
        let u: Vec<f32> = uniform_noise(&mut rng, 256, &device)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(u.iter().all(|v| (0.0..1.0).contains(v)));

        let l: Vec<f32> = logistic_noise(&mut rng, 256, &device)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(l.iter().all(|v| v.is_finite()));
        assert!(l.iter().any(|&v| v > 0.0) && l.iter().any(|&v| v < 0.0));
    }

    #[test]
    fn test_check_parameter_shape() {
        assert!(check_parameter_shape(&[vec![1.0, 2.0]], 1, 2).is_ok());
        assert!(check_parameter_shape(&[vec![1.0]], 1, 2).is_err());
        assert!(check_parameter_shape(&[], 1, 2).is_err());
        assert!(check_parameter_shape(&[vec![f32::INFINITY, 0.0]], 1, 2).is_err());
    }

    #[test]
    fn test_columns_to_rows() {
        let rows = columns_to_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(rows, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }
}
