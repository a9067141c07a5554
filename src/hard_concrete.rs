//! Hard-concrete gate sampler (HCGS)
//!
//! Each element carries a learnable logit `log_alpha` and a temperature. A
//! sample draws logistic noise, squashes it through a tempered sigmoid,
//! stretches the result to `[left, right]` (with `left < 0 < 1 < right`) and
//! clamps back to `[0, 1]`, so exact zeros and ones have positive probability:
//!
//! ```text
//! s = sigmoid((ln u - ln(1 - u) + log_alpha) / (relu(temp) + floor))
//! c = clamp(s * (right - left) + left, 0, 1)
//! ```
//!
//! The sparsity penalty is the closed-form probability that `c > 0`:
//!
//! ```text
//! P(c > 0) = sigmoid(log_alpha - (relu(temp) + floor) * ln(-left / right))
//! ```
//!
//! In edge mode an optional vertex penalty treats a source vertex as active
//! when any of its outgoing edges is, `1 - prod(1 - P(c_e > 0))`, and is
//! weighted independently of the edge penalty. This is deliberately not the
//! narrower "every incident edge active" reading: a vertex that keeps a
//! single outgoing edge still has to be computed, so it pays the full vertex
//! cost.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::PruningConfig;
use crate::error::{PruneError, Result};
use crate::graph::{GraphDescriptor, PruningMode};
use crate::sampler::{
    check_parameter_shape, check_unit_interval, columns_to_rows, logistic_noise, MaskSampler,
    SamplerMode,
};

/// Temperature restored by [`HardConcreteSampler::fix_nans`]
pub const DEFAULT_TEMPERATURE: f32 = 2.0 / 3.0;

/// Regularization diagnostics for logging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskStats {
    /// Aggregated `P(c > 0)` over elements
    pub complexity: f32,
    /// Aggregated vertex activity, zero when vertex regularization is off
    pub vertex_complexity: f32,
    /// Mean raw temperature
    pub avg_temperature: f32,
    /// Mean temperature among elements above one (one if none are)
    pub temperature_above_one: f32,
    /// Mean of `2 * sigmoid(relu(temp)) - 1`
    pub temperature_count: f32,
    /// Value of the squared-temperature penalty
    pub temperature_reg: f32,
}

/// Hard-concrete gate sampler
#[derive(Debug)]
pub struct HardConcreteSampler {
    log_alpha: Var,
    temperature: Var,
    left: f64,
    right: f64,
    temperature_floor: f64,
    lambda: f64,
    vertex_lambda: f64,
    complexity_mean: bool,
    temperature_reg: f64,
    learn_temperature: bool,
    /// `(n_sources, n_edges)` 0/1 matrix of outgoing edges per source vertex
    vertex_incidence: Option<Tensor>,
    rng: StdRng,
    mode: SamplerMode,
    device: Device,
}

impl HardConcreteSampler {
    /// Sampler over `n` elements with every logit at `config.init_logit`
    pub fn new(n: usize, config: &PruningConfig, device: &Device) -> Result<Self> {
        Self::with_logits(vec![config.init_logit as f32; n], config, device)
    }

    /// Sampler with explicit initial logits
    pub fn with_logits(logits: Vec<f32>, config: &PruningConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let n = logits.len();
        if n == 0 {
            return Err(PruneError::Config("sampler needs at least one element".into()));
        }
        let log_alpha = Var::from_tensor(&Tensor::from_vec(logits, n, device)?)?;
        let temperature =
            Var::from_tensor(&Tensor::full(config.init_temperature as f32, n, device)?)?;
        Ok(Self {
            log_alpha,
            temperature,
            left: config.stretch.0,
            right: config.stretch.1,
            temperature_floor: config.temperature_floor,
            lambda: config.lambda,
            vertex_lambda: config.vertex_lambda,
            complexity_mean: config.complexity_mean,
            temperature_reg: config.temperature_reg,
            learn_temperature: config.learn_temperature,
            vertex_incidence: None,
            rng: StdRng::seed_from_u64(config.seed),
            mode: SamplerMode::Training,
            device: device.clone(),
        })
    }

    /// Sampler sized for a graph and pruning mode.
    ///
    /// Edge mode with a positive `vertex_lambda` also enables vertex
    /// regularization.
    pub fn for_graph(
        graph: &GraphDescriptor,
        mode: PruningMode,
        config: &PruningConfig,
        device: &Device,
    ) -> Result<Self> {
        let sampler = Self::new(graph.n_elements(mode), config, device)?;
        let sampler = if mode == PruningMode::Edge && config.vertex_lambda > 0.0 {
            sampler.with_vertex_regularization(graph)?
        } else {
            sampler
        };
        info!(
            "HCGS sampler: {} {} elements, lambda={}, vertex_lambda={}",
            sampler.len(),
            mode,
            sampler.lambda,
            sampler.vertex_lambda
        );
        Ok(sampler)
    }

    /// Add the vertex penalty over the source vertices of an edge mask
    pub fn with_vertex_regularization(mut self, graph: &GraphDescriptor) -> Result<Self> {
        let n = self.len();
        if n != graph.n_edges() {
            return Err(PruneError::ShapeMismatch {
                what: "edge mask for vertex regularization".into(),
                expected: graph.n_edges(),
                got: n,
            });
        }
        let groups = graph.source_groups();
        let mut incidence = vec![0f32; groups.len() * n];
        for (row, (_, edges)) in groups.iter().enumerate() {
            for &e in edges {
                incidence[row * n + e] = 1.0;
            }
        }
        self.vertex_incidence = Some(Tensor::from_vec(
            incidence,
            (groups.len(), n),
            &self.device,
        )?);
        Ok(self)
    }

    pub fn log_alpha(&self) -> &Tensor {
        self.log_alpha.as_tensor()
    }

    pub fn temperature(&self) -> &Tensor {
        self.temperature.as_tensor()
    }

    pub fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    pub fn set_vertex_lambda(&mut self, vertex_lambda: f64) {
        self.vertex_lambda = vertex_lambda;
    }

    /// Change the squared-temperature coefficient between steps
    pub fn set_temperature_reg(&mut self, temperature_reg: f64) {
        self.temperature_reg = temperature_reg;
    }

    fn effective_temperature(&self) -> Result<Tensor> {
        Ok((self.temperature.as_tensor().relu()? + self.temperature_floor)?)
    }

    fn aggregate(&self, t: &Tensor) -> Result<Tensor> {
        Ok(if self.complexity_mean {
            t.mean_all()?
        } else {
            t.sum_all()?
        })
    }

    /// Per-element probability that the clamped gate is nonzero
    pub fn nonzero_probability(&self) -> Result<Tensor> {
        let shift = (-self.left / self.right).ln();
        let logits = (self.log_alpha.as_tensor() - (self.effective_temperature()? * shift)?)?;
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }

    /// Aggregated edge or vertex complexity
    pub fn complexity(&self) -> Result<Tensor> {
        self.aggregate(&self.nonzero_probability()?)
    }

    /// Aggregated probability that each source vertex keeps an outgoing edge.
    ///
    /// Any live outgoing edge counts the vertex as active, rather than
    /// requiring all of its incident edges to be active.
    pub fn vertex_complexity(&self) -> Result<Option<Tensor>> {
        let Some(incidence) = &self.vertex_incidence else {
            return Ok(None);
        };
        let log_off = self
            .nonzero_probability()?
            .affine(-1.0, 1.0)?
            .clamp(1e-6f32, 1f32)?
            .log()?;
        let vertex_on = incidence
            .matmul(&log_off.unsqueeze(1)?)?
            .squeeze(1)?
            .exp()?
            .affine(-1.0, 1.0)?;
        Ok(Some(self.aggregate(&vertex_on)?))
    }

    fn temperature_penalty(&self) -> Result<Tensor> {
        Ok((self.temperature.as_tensor().sqr()?.sum_all()? * self.temperature_reg)?)
    }

    /// Current regularization diagnostics
    pub fn stats(&self) -> Result<MaskStats> {
        let complexity = self.complexity()?.to_scalar::<f32>()?;
        let vertex_complexity = match self.vertex_complexity()? {
            Some(v) => v.to_scalar::<f32>()?,
            None => 0.0,
        };
        let temps: Vec<f32> = self.temperature.as_tensor().to_vec1()?;
        let n = temps.len() as f32;
        let avg_temperature = temps.iter().sum::<f32>() / n;
        let above: Vec<f32> = temps.iter().copied().filter(|&t| t > 1.0).collect();
        let temperature_above_one = if above.is_empty() {
            1.0
        } else {
            above.iter().sum::<f32>() / above.len() as f32
        };
        let temperature_count = temps
            .iter()
            .map(|&t| 2.0 / (1.0 + (-t.max(0.0)).exp()) - 1.0)
            .sum::<f32>()
            / n;
        let temperature_reg = self.temperature_penalty()?.to_scalar::<f32>()?;
        Ok(MaskStats {
            complexity,
            vertex_complexity,
            avg_temperature,
            temperature_above_one,
            temperature_count,
            temperature_reg,
        })
    }
}

impl MaskSampler for HardConcreteSampler {
    fn kind(&self) -> &'static str {
        "hcgs"
    }

    fn len(&self) -> usize {
        self.log_alpha.as_tensor().elem_count()
    }

    fn sample(&mut self) -> Result<Tensor> {
        if self.mode == SamplerMode::Frozen {
            return self.resolve();
        }
        let n = self.len();
        let noise = logistic_noise(&mut self.rng, n, &self.device)?;
        let gate = noise
            .add(self.log_alpha.as_tensor())?
            .div(&self.effective_temperature()?)?;
        let mask = candle_nn::ops::sigmoid(&gate)?
            .affine(self.right - self.left, self.left)?
            .clamp(0f32, 1f32)?;
        check_unit_interval(&mask, "hcgs sample")?;
        Ok(mask)
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        let mut loss = (self.complexity()? * self.lambda)?;
        if let Some(vertex) = self.vertex_complexity()? {
            loss = (loss + (vertex * self.vertex_lambda)?)?;
        }
        if self.temperature_reg > 0.0 {
            loss = (loss + self.temperature_penalty()?)?;
        }
        Ok(loss)
    }

    fn resolve(&self) -> Result<Tensor> {
        let mask = candle_nn::ops::sigmoid(self.log_alpha.as_tensor())?
            .affine(self.right - self.left, self.left)?
            .clamp(0f32, 1f32)?
            .detach();
        check_unit_interval(&mask, "hcgs resolved mask")?;
        Ok(mask)
    }

    fn fix_nans(&mut self) -> Result<bool> {
        let mut temps: Vec<f32> = self.temperature.as_tensor().to_vec1()?;
        let n_nan = temps.iter().filter(|t| t.is_nan()).count();
        if n_nan > 0 {
            warn!("Resetting {n_nan} NaN temperatures to {DEFAULT_TEMPERATURE}");
            for t in temps.iter_mut().filter(|t| t.is_nan()) {
                *t = DEFAULT_TEMPERATURE;
            }
            let n = temps.len();
            self.temperature.set(&Tensor::from_vec(temps, n, &self.device)?)?;
        }
        let logits: Vec<f32> = self.log_alpha.as_tensor().to_vec1()?;
        let temps: Vec<f32> = self.temperature.as_tensor().to_vec1()?;
        Ok(logits.iter().chain(temps.iter()).all(|v| v.is_finite()))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match (self.mode, self.learn_temperature) {
            (SamplerMode::Frozen, _) => Vec::new(),
            (SamplerMode::Training, true) => vec![self.log_alpha.clone(), self.temperature.clone()],
            (SamplerMode::Training, false) => vec![self.log_alpha.clone()],
        }
    }

    fn mode(&self) -> SamplerMode {
        self.mode
    }

    fn freeze(&mut self) {
        if self.mode == SamplerMode::Training {
            info!("Freezing HCGS sampler ({} elements)", self.len());
            self.mode = SamplerMode::Frozen;
        }
    }

    fn parameters(&self) -> Result<Vec<Vec<f32>>> {
        let logits: Vec<f32> = self.log_alpha.as_tensor().to_vec1()?;
        let temps: Vec<f32> = self.temperature.as_tensor().to_vec1()?;
        Ok(columns_to_rows(&[logits, temps]))
    }

    fn parameter_width(&self) -> usize {
        2
    }

    fn load_parameters(&mut self, params: &[Vec<f32>]) -> Result<()> {
        let n = self.len();
        check_parameter_shape(params, n, 2)?;
        let logits: Vec<f32> = params.iter().map(|row| row[0]).collect();
        let temps: Vec<f32> = params.iter().map(|row| row[1]).collect();
        let logits = Tensor::from_vec(logits, n, &self.device)?;
        let temps = Tensor::from_vec(temps, n, &self.device)?;
        self.log_alpha.set(&logits)?;
        self.temperature.set(&temps)?;
        debug!("Loaded HCGS parameters for {n} elements");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ArchitectureConfig;
    use proptest::prelude::*;

    fn config() -> PruningConfig {
        PruningConfig::default()
    }

    fn total(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_samples_in_unit_interval() {
        let mut sampler = HardConcreteSampler::new(64, &config(), &Device::Cpu).unwrap();
        for _ in 0..10 {
            let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
            assert_eq!(mask.len(), 64);
            assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_stretch_reaches_exact_bounds() {
        let logits = vec![10.0, -10.0];
        let sampler = HardConcreteSampler::with_logits(logits, &config(), &Device::Cpu).unwrap();
        let resolved: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
        assert_eq!(resolved, vec![1.0, 0.0]);
    }

    #[test]
    fn test_frozen_sampler_is_deterministic() {
        let mut sampler = HardConcreteSampler::new(8, &config(), &Device::Cpu).unwrap();
        assert_eq!(sampler.mode(), SamplerMode::Training);
        assert_eq!(sampler.trainable_vars().len(), 2);

        sampler.freeze();
        assert_eq!(sampler.mode(), SamplerMode::Frozen);
        assert!(sampler.trainable_vars().is_empty());

        let a: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixed_temperature_is_not_trainable() {
        let config = PruningConfig {
            learn_temperature: false,
            ..config()
        };
        let sampler = HardConcreteSampler::new(4, &config, &Device::Cpu).unwrap();
        assert_eq!(sampler.trainable_vars().len(), 1);
    }

    #[test]
    fn test_gradients_reach_logits() {
        let mut sampler = HardConcreteSampler::new(5, &config(), &Device::Cpu).unwrap();
        let loss = (sampler.sample().unwrap().sum_all().unwrap()
            + sampler.regularization_loss().unwrap())
        .unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(sampler.log_alpha()).is_some());
    }

    #[test]
    fn test_same_seed_same_samples() {
        let mut a = HardConcreteSampler::new(16, &config(), &Device::Cpu).unwrap();
        let mut b = HardConcreteSampler::new(16, &config(), &Device::Cpu).unwrap();
        let sa: Vec<f32> = a.sample().unwrap().to_vec1().unwrap();
        let sb: Vec<f32> = b.sample().unwrap().to_vec1().unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_complexity_sum_and_mean() {
        let sampler = HardConcreteSampler::new(10, &config(), &Device::Cpu).unwrap();
        let sum = total(&sampler.complexity().unwrap());

        let mean_config = PruningConfig {
            complexity_mean: true,
            ..config()
        };
        let sampler = HardConcreteSampler::new(10, &mean_config, &Device::Cpu).unwrap();
        let mean = total(&sampler.complexity().unwrap());
        assert!((sum / 10.0 - mean).abs() < 1e-5);
    }

    #[test]
    fn test_temperature_penalty() {
        let config = PruningConfig {
            lambda: 0.0,
            temperature_reg: 0.5,
            ..config()
        };
        let mut sampler = HardConcreteSampler::new(3, &config, &Device::Cpu).unwrap();
        let expected = 0.5 * 3.0 * (2.0f32 / 3.0).powi(2);
        assert!((total(&sampler.regularization_loss().unwrap()) - expected).abs() < 1e-5);

        sampler.set_temperature_reg(0.0);
        assert!(total(&sampler.regularization_loss().unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_fix_nans_restores_default() {
        let mut sampler = HardConcreteSampler::new(3, &config(), &Device::Cpu).unwrap();
        let temps = Tensor::new(&[f32::NAN, 0.5, f32::NAN], &Device::Cpu).unwrap();
        sampler.temperature.set(&temps).unwrap();

        assert!(sampler.fix_nans().unwrap());
        let temps: Vec<f32> = sampler.temperature().to_vec1().unwrap();
        assert_eq!(temps, vec![DEFAULT_TEMPERATURE, 0.5, DEFAULT_TEMPERATURE]);
    }

    #[test]
    fn test_stats() {
        let sampler = HardConcreteSampler::new(4, &config(), &Device::Cpu).unwrap();
        let stats = sampler.stats().unwrap();
        assert!((stats.avg_temperature - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(stats.temperature_above_one, 1.0);
        assert_eq!(stats.vertex_complexity, 0.0);
        assert!(stats.complexity > 0.0 && stats.complexity < 4.0);
        assert!(stats.temperature_count > 0.0 && stats.temperature_count < 1.0);
    }

    #[test]
    fn test_vertex_regularization() {
        let graph = GraphDescriptor::new(ArchitectureConfig::new(1, 1)).unwrap();
        let config = PruningConfig {
            vertex_lambda: 1.0,
            ..config()
        };
        let sampler =
            HardConcreteSampler::for_graph(&graph, PruningMode::Edge, &config, &Device::Cpu)
                .unwrap();
        let vertex = total(&sampler.vertex_complexity().unwrap().unwrap());
        let n_sources = graph.source_groups().len() as f32;
        assert!(vertex > 0.0 && vertex <= n_sources);

        // a source is at least as active as its most active outgoing edge
        let edge = total(&sampler.complexity().unwrap()) / graph.n_edges() as f32;
        assert!(vertex / n_sources >= edge - 1e-5);

        let off = HardConcreteSampler::with_logits(
            vec![-20.0; graph.n_edges()],
            &config,
            &Device::Cpu,
        )
        .unwrap()
        .with_vertex_regularization(&graph)
        .unwrap();
        assert!(total(&off.vertex_complexity().unwrap().unwrap()) < 1e-3);
    }

    #[test]
    fn test_vertex_regularization_rejects_vertex_mask() {
        let graph = GraphDescriptor::new(ArchitectureConfig::new(1, 1)).unwrap();
        let sampler = HardConcreteSampler::new(
            graph.n_elements(PruningMode::Vertex),
            &config(),
            &Device::Cpu,
        )
        .unwrap();
        assert!(sampler.with_vertex_regularization(&graph).is_err());
    }

    #[test]
    fn test_parameters_round_trip() {
        let mut sampler = HardConcreteSampler::new(3, &config(), &Device::Cpu).unwrap();
        let params = vec![vec![0.5, 1.0], vec![-1.0, 0.2], vec![2.0, 0.7]];
        sampler.load_parameters(&params).unwrap();
        assert_eq!(sampler.parameters().unwrap(), params);

        assert!(sampler.load_parameters(&params[..2]).is_err());
        assert!(sampler.load_parameters(&[vec![0.0], vec![0.0], vec![0.0]]).is_err());
        assert_eq!(sampler.parameters().unwrap(), params);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_samples_stay_in_unit_interval(
            logits in prop::collection::vec(-12.0f32..12.0, 1..24),
            temperature in -1.0f64..4.0,
            seed in 0u64..1000,
        ) {
            let config = PruningConfig { init_temperature: temperature, seed, ..PruningConfig::default() };
            let mut sampler = HardConcreteSampler::with_logits(logits, &config, &Device::Cpu).unwrap();
            let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
            prop_assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
            let resolved: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
            prop_assert!(resolved.iter().all(|v| (0.0..=1.0).contains(v)));
        }

        #[test]
        fn prop_regularization_monotone_in_logits(
            logits in prop::collection::vec(-6.0f32..6.0, 1..16),
            shift in 0.0f32..4.0,
        ) {
            let config = PruningConfig::default();
            let raised: Vec<f32> = logits.iter().map(|l| l + shift).collect();
            let low = HardConcreteSampler::with_logits(logits, &config, &Device::Cpu).unwrap();
            let high = HardConcreteSampler::with_logits(raised, &config, &Device::Cpu).unwrap();
            let low_mass = total(&low.nonzero_probability().unwrap().sum_all().unwrap());
            let high_mass = total(&high.nonzero_probability().unwrap().sum_all().unwrap());
            prop_assert!(high_mass >= low_mass - 1e-5);
            let low_loss = total(&low.regularization_loss().unwrap());
            let high_loss = total(&high.regularization_loss().unwrap());
            prop_assert!(high_loss >= low_loss - 1e-5);
        }
    }
}
