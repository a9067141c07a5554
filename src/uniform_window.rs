//! Uniform-window sampler (UGS)
//!
//! Each element carries a learnable threshold logit `theta`. A sample draws
//! `u ~ U(0, 1)`, places it in a window of width `w` centred on the
//! threshold, and squashes the result with the same stretched, clamped
//! sigmoid the hard-concrete sampler uses:
//!
//! ```text
//! z = theta + w * (u - 1/2)
//! c = clamp(sigmoid(z) * (right - left) + left, 0, 1)
//! ```
//!
//! A threshold far above the window edge gives `c = 1` on every draw, one
//! far below gives `c = 0`. With `k = ln(-left / right)` the gate is nonzero
//! exactly when `z > k`, so the penalty is the closed-form active mass
//!
//! ```text
//! P(c > 0) = clamp((theta - k) / w + 1/2, 0, 1)
//! ```
//!
//! scaled by `lambda`, summed or averaged.
//!
//! The window width comes from [`WindowSchedule`] evaluated at the current
//! training step and never drops below `window_floor`.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{PruningConfig, WindowSchedule};
use crate::error::{PruneError, Result};
use crate::graph::{GraphDescriptor, PruningMode};
use crate::sampler::{
    check_parameter_shape, check_unit_interval, uniform_noise, MaskSampler, SamplerMode,
};

/// Uniform-window sampler
#[derive(Debug)]
pub struct UniformWindowSampler {
    theta: Var,
    left: f64,
    right: f64,
    base_window: f64,
    window_floor: f64,
    schedule: WindowSchedule,
    step: usize,
    lambda: f64,
    complexity_mean: bool,
    rng: StdRng,
    mode: SamplerMode,
    device: Device,
}

impl UniformWindowSampler {
    /// Sampler over `n` elements with every threshold logit at `config.init_logit`
    pub fn new(n: usize, config: &PruningConfig, device: &Device) -> Result<Self> {
        Self::with_thresholds(vec![config.init_logit as f32; n], config, device)
    }

    /// Sampler with explicit initial threshold logits
    pub fn with_thresholds(
        thresholds: Vec<f32>,
        config: &PruningConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let n = thresholds.len();
        if n == 0 {
            return Err(PruneError::Config("sampler needs at least one element".into()));
        }
        Ok(Self {
            theta: Var::from_tensor(&Tensor::from_vec(thresholds, n, device)?)?,
            left: config.stretch.0,
            right: config.stretch.1,
            base_window: config.window,
            window_floor: config.window_floor,
            schedule: config.window_schedule.clone(),
            step: 0,
            lambda: config.lambda,
            complexity_mean: config.complexity_mean,
            rng: StdRng::seed_from_u64(config.seed),
            mode: SamplerMode::Training,
            device: device.clone(),
        })
    }

    pub fn for_graph(
        graph: &GraphDescriptor,
        mode: PruningMode,
        config: &PruningConfig,
        device: &Device,
    ) -> Result<Self> {
        let sampler = Self::new(graph.n_elements(mode), config, device)?;
        info!(
            "UGS sampler: {} {} elements, window={}",
            sampler.len(),
            mode,
            sampler.window()
        );
        Ok(sampler)
    }

    pub fn theta(&self) -> &Tensor {
        self.theta.as_tensor()
    }

    /// Training step used to evaluate the window schedule
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Window width at the current step
    pub fn window(&self) -> f64 {
        self.schedule
            .window_at(self.step, self.base_window)
            .max(self.window_floor)
    }

    /// Logit below which the squashed gate is clamped to zero
    fn zero_logit(&self) -> f64 {
        (-self.left / self.right).ln()
    }

    /// Per-element probability that a sampled gate is nonzero
    pub fn active_probability(&self) -> Result<Tensor> {
        let w = self.window();
        let p = self
            .theta
            .as_tensor()
            .affine(1.0 / w, 0.5 - self.zero_logit() / w)?
            .clamp(0f32, 1f32)?;
        Ok(p)
    }

    fn squash(&self, z: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(z)?
            .affine(self.right - self.left, self.left)?
            .clamp(0f32, 1f32)?)
    }
}

impl MaskSampler for UniformWindowSampler {
    fn kind(&self) -> &'static str {
        "ugs"
    }

    fn len(&self) -> usize {
        self.theta.as_tensor().elem_count()
    }

    fn sample(&mut self) -> Result<Tensor> {
        if self.mode == SamplerMode::Frozen {
            return self.resolve();
        }
        let n = self.len();
        let w = self.window();
        let u = uniform_noise(&mut self.rng, n, &self.device)?;
        let z = self.theta.as_tensor().add(&u.affine(w, -0.5 * w)?)?;
        let mask = self.squash(&z)?;
        check_unit_interval(&mask, "ugs sample")?;
        Ok(mask)
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        let p = self.active_probability()?;
        let mass = if self.complexity_mean {
            p.mean_all()?
        } else {
            p.sum_all()?
        };
        Ok((mass * self.lambda)?)
    }

    fn resolve(&self) -> Result<Tensor> {
        let mask = self.squash(self.theta.as_tensor())?.detach();
        check_unit_interval(&mask, "ugs resolved mask")?;
        Ok(mask)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match self.mode {
            SamplerMode::Training => vec![self.theta.clone()],
            SamplerMode::Frozen => Vec::new(),
        }
    }

    fn mode(&self) -> SamplerMode {
        self.mode
    }

    fn freeze(&mut self) {
        if self.mode == SamplerMode::Training {
            info!("Freezing UGS sampler ({} elements)", self.len());
            self.mode = SamplerMode::Frozen;
        }
    }

    fn parameters(&self) -> Result<Vec<Vec<f32>>> {
        let theta: Vec<f32> = self.theta.as_tensor().to_vec1()?;
        Ok(theta.into_iter().map(|t| vec![t]).collect())
    }

    fn parameter_width(&self) -> usize {
        1
    }

    fn load_parameters(&mut self, params: &[Vec<f32>]) -> Result<()> {
        let n = self.len();
        check_parameter_shape(params, n, 1)?;
        let theta: Vec<f32> = params.iter().map(|row| row[0]).collect();
        self.theta.set(&Tensor::from_vec(theta, n, &self.device)?)?;
        debug!("Loaded UGS parameters for {n} elements");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn total(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_samples_in_unit_interval() {
        let mut sampler =
            UniformWindowSampler::new(32, &PruningConfig::default(), &Device::Cpu).unwrap();
        for _ in 0..10 {
            let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
            assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_resolve_follows_threshold() {
        let sampler = UniformWindowSampler::with_thresholds(
            vec![6.0, 0.0, -6.0],
            &PruningConfig::default(),
            &Device::Cpu,
        )
        .unwrap();
        let resolved: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
        assert_eq!(resolved[0], 1.0);
        assert!((resolved[1] - 0.5).abs() < 1e-6);
        assert_eq!(resolved[2], 0.0);
    }

    #[test]
    fn test_extreme_thresholds_are_deterministic() {
        let mut sampler = UniformWindowSampler::with_thresholds(
            vec![-30.0, 30.0],
            &PruningConfig::default(),
            &Device::Cpu,
        )
        .unwrap();
        for _ in 0..500 {
            let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
            assert_eq!(mask, vec![0.0, 1.0]);
        }
    }

    #[test]
    fn test_samples_stay_inside_window() {
        let config = PruningConfig {
            window: 0.5,
            ..PruningConfig::default()
        };
        let mut sampler =
            UniformWindowSampler::with_thresholds(vec![1.0], &config, &Device::Cpu).unwrap();
        let edge = |z: f32| {
            let s = 1.0 / (1.0 + (-z).exp());
            (s * 1.2 - 0.1).clamp(0.0, 1.0)
        };
        let (lo, hi) = (edge(0.75), edge(1.25));
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..500 {
            let c = sampler.sample().unwrap().to_vec1::<f32>().unwrap()[0];
            assert!(c >= lo - 1e-5 && c <= hi + 1e-5, "{c} outside [{lo}, {hi}]");
            seen_low |= c < (lo + hi) / 2.0;
            seen_high |= c > (lo + hi) / 2.0;
        }
        assert!(seen_low && seen_high);
    }

    #[test]
    fn test_window_schedule_and_floor() {
        let config = PruningConfig {
            window: 0.5,
            window_floor: 0.05,
            window_schedule: WindowSchedule::Steps {
                steps: vec![(10, 0.2), (20, 0.01)],
            },
            ..PruningConfig::default()
        };
        let mut sampler = UniformWindowSampler::new(2, &config, &Device::Cpu).unwrap();
        assert!((sampler.window() - 0.5).abs() < 1e-12);
        sampler.set_step(15);
        assert!((sampler.window() - 0.2).abs() < 1e-12);
        sampler.set_step(25);
        assert!((sampler.window() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_freeze() {
        let mut sampler =
            UniformWindowSampler::new(4, &PruningConfig::default(), &Device::Cpu).unwrap();
        assert_eq!(sampler.trainable_vars().len(), 1);
        sampler.freeze();
        assert!(sampler.trainable_vars().is_empty());
        let a: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_regularization_is_active_mass() {
        let config = PruningConfig {
            lambda: 2.0,
            ..PruningConfig::default()
        };
        // ln(0.1 / 1.1): the gate is nonzero on exactly half the window
        let k = (0.1f32 / 1.1).ln();
        let sampler = UniformWindowSampler::with_thresholds(
            vec![k, k, 30.0, -30.0],
            &config,
            &Device::Cpu,
        )
        .unwrap();
        let p: Vec<f32> = sampler.active_probability().unwrap().to_vec1().unwrap();
        assert!((p[0] - 0.5).abs() < 1e-4);
        assert_eq!(&p[2..], &[1.0, 0.0]);
        assert!((total(&sampler.regularization_loss().unwrap()) - 2.0 * 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_penalty_gradient_inside_window() {
        let k = (0.1f32 / 1.1).ln();
        let sampler = UniformWindowSampler::with_thresholds(
            vec![k, 30.0],
            &PruningConfig::default(),
            &Device::Cpu,
        )
        .unwrap();
        let grads = sampler.regularization_loss().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(sampler.theta()).unwrap().to_vec1().unwrap();
        assert!(g[0] > 0.0);
        assert_eq!(g[1], 0.0);
    }

    #[test]
    fn test_parameters_round_trip() {
        let mut sampler =
            UniformWindowSampler::new(2, &PruningConfig::default(), &Device::Cpu).unwrap();
        sampler.load_parameters(&[vec![0.25], vec![-3.0]]).unwrap();
        assert_eq!(sampler.parameters().unwrap(), vec![vec![0.25], vec![-3.0]]);
        assert!(sampler.load_parameters(&[vec![0.25, 1.0], vec![0.0, 1.0]]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_samples_stay_in_unit_interval(
            thresholds in prop::collection::vec(-12.0f32..12.0, 1..24),
            window in 0.001f64..2.0,
            seed in 0u64..1000,
        ) {
            let config = PruningConfig { window, seed, ..PruningConfig::default() };
            let mut sampler = UniformWindowSampler::with_thresholds(thresholds, &config, &Device::Cpu).unwrap();
            let mask: Vec<f32> = sampler.sample().unwrap().to_vec1().unwrap();
            prop_assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
            let resolved: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
            prop_assert!(resolved.iter().all(|v| (0.0..=1.0).contains(v)));
        }

        #[test]
        fn prop_regularization_monotone_in_mass(
            thresholds in prop::collection::vec(-6.0f32..6.0, 1..16),
            shift in 0.0f32..4.0,
        ) {
            let config = PruningConfig::default();
            let raised: Vec<f32> = thresholds.iter().map(|t| t + shift).collect();
            let low = UniformWindowSampler::with_thresholds(thresholds, &config, &Device::Cpu).unwrap();
            let high = UniformWindowSampler::with_thresholds(raised, &config, &Device::Cpu).unwrap();
            let low_loss = total(&low.regularization_loss().unwrap());
            let high_loss = total(&high.regularization_loss().unwrap());
            prop_assert!(high_loss >= low_loss - 1e-5);
        }
    }
}
