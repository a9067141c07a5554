//! Pruning configuration
//!
//! Loaded from JSON; every field has a default so a config file only needs
//! the values it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PruneError, Result};

/// How the UGS window width evolves over training steps.
///
/// No decay curve is assumed: either the window is fixed, or the caller
/// lists `(from_step, window)` breakpoints and the width is piecewise
/// constant between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WindowSchedule {
    /// Always use `PruningConfig::window`
    Static,
    /// Piecewise-constant widths starting at the given steps
    Steps { steps: Vec<(usize, f64)> },
}

impl Default for WindowSchedule {
    fn default() -> Self {
        Self::Static
    }
}

impl WindowSchedule {
    /// Window width at `step`, falling back to `base` before the first breakpoint
    pub fn window_at(&self, step: usize, base: f64) -> f64 {
        match self {
            Self::Static => base,
            Self::Steps { steps } => steps
                .iter()
                .filter(|(from, _)| *from <= step)
                .max_by_key(|(from, _)| *from)
                .map_or(base, |(_, w)| *w),
        }
    }
}

/// Hyperparameters shared by samplers and pruners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Weight of the element sparsity penalty
    pub lambda: f64,
    /// Weight of the vertex penalty in edge pruning
    pub vertex_lambda: f64,
    /// Average the sparsity penalty instead of summing it
    pub complexity_mean: bool,
    /// Initial HCGS logit (log alpha) or UGS threshold
    pub init_logit: f64,
    /// Initial HCGS temperature
    pub init_temperature: f64,
    /// Whether the HCGS temperature is a trainable parameter
    pub learn_temperature: bool,
    /// Coefficient on the squared temperature
    pub temperature_reg: f64,
    /// Lower bound added to the rectified temperature
    pub temperature_floor: f64,
    /// Stretch interval of the hard-concrete gate, `[left, right]`
    pub stretch: (f64, f64),
    /// Base UGS window width
    pub window: f64,
    /// Smallest UGS window width ever used
    pub window_floor: f64,
    /// UGS window schedule
    pub window_schedule: WindowSchedule,
    /// Strict threshold for circuit extraction
    pub threshold: f64,
    /// Seed for mask noise
    pub seed: u64,
    /// Learning rate of mask parameters
    pub lr: f64,
    /// Learning rate of ablation constants
    pub lr_constants: f64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            vertex_lambda: 0.0,
            complexity_mean: false,
            init_logit: 1.0,
            init_temperature: 2.0 / 3.0,
            learn_temperature: true,
            temperature_reg: 0.0,
            temperature_floor: 1e-3,
            stretch: (-0.1, 1.1),
            window: 0.5,
            window_floor: 1e-3,
            window_schedule: WindowSchedule::Static,
            threshold: 0.5,
            seed: 42,
            lr: 0.1,
            lr_constants: 0.002,
        }
    }
}

impl PruningConfig {
    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break sampling or training
    pub fn validate(&self) -> Result<()> {
        if self.lambda < 0.0 || self.vertex_lambda < 0.0 || self.temperature_reg < 0.0 {
            return Err(PruneError::Config(
                "regularization weights must be non-negative".into(),
            ));
        }
        if self.temperature_floor <= 0.0 {
            return Err(PruneError::Config(format!(
                "temperature_floor must be positive, got {}",
                self.temperature_floor
            )));
        }
        let (left, right) = self.stretch;
        if !(left < 0.0 && right > 1.0) {
            return Err(PruneError::Config(format!(
                "stretch interval ({left}, {right}) must strictly contain [0, 1]"
            )));
        }
        if self.window_floor <= 0.0 || self.window < self.window_floor {
            return Err(PruneError::Config(format!(
                "window {} must be at least window_floor {} > 0",
                self.window, self.window_floor
            )));
        }
        if let WindowSchedule::Steps { steps } = &self.window_schedule {
            if let Some((step, w)) = steps.iter().find(|(_, w)| !(*w > 0.0)) {
                return Err(PruneError::Config(format!(
                    "window schedule entry at step {step} is not positive: {w}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(PruneError::Config(format!(
                "threshold must be in [0, 1), got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}
