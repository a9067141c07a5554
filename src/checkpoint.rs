//! Mask checkpoints
//!
//! Sampler parameters and ablation constants are saved as JSON maps keyed by
//! element id (`a1.0`, `a0.1->a1.0.q`, ...) alongside the architecture they
//! were trained on. Restoring validates everything before touching the
//! pruner: a checkpoint for another architecture, pruning mode or sampler
//! is rejected whole, never partially applied.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PruningConfig;
use crate::error::{PruneError, Result};
use crate::graph::{ArchitectureConfig, GraphDescriptor, PruningMode};
use crate::hard_concrete::HardConcreteSampler;
use crate::pruner::Pruner;
use crate::sampler::{ConstantSampler, MaskSampler};
use crate::uniform_window::UniformWindowSampler;

/// Serialized state of a pruner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskCheckpoint {
    pub architecture: ArchitectureConfig,
    pub mode: PruningMode,
    /// Sampler kind, see [`MaskSampler::kind`]
    pub sampler: String,
    /// Hyperparameters the sampler was built with
    pub config: PruningConfig,
    /// Per-element sampler parameters keyed by element id
    pub parameters: BTreeMap<String, Vec<f32>>,
    /// Ablation constants keyed by vertex id
    pub constants: BTreeMap<String, Vec<f32>>,
}

impl MaskCheckpoint {
    /// Snapshot a pruner's sampler and constants
    pub fn capture<P: Pruner + ?Sized>(pruner: &P, config: &PruningConfig) -> Result<Self> {
        let graph = pruner.graph();
        let mode = pruner.mode();
        let ids = graph.element_ids(mode);
        let rows = pruner.sampler().parameters()?;
        if rows.len() != ids.len() {
            return Err(PruneError::ShapeMismatch {
                what: format!("{} sampler parameters", pruner.sampler().kind()),
                expected: ids.len(),
                got: rows.len(),
            });
        }
        Ok(Self {
            architecture: graph.architecture().clone(),
            mode,
            sampler: pruner.sampler().kind().to_string(),
            config: config.clone(),
            parameters: ids.into_iter().zip(rows).collect(),
            constants: pruner.constants().to_map()?,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(
            "Saved {} checkpoint ({} elements, {} constants) to {}",
            self.sampler,
            self.parameters.len(),
            self.constants.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&content)?;
        info!(
            "Loaded {} checkpoint for {} from {}",
            checkpoint.sampler,
            checkpoint.architecture,
            path.display()
        );
        Ok(checkpoint)
    }

    /// Fail unless this checkpoint was produced for `graph` in `mode`
    pub fn check_compatible(&self, graph: &GraphDescriptor, mode: PruningMode) -> Result<()> {
        if &self.architecture != graph.architecture() {
            return Err(PruneError::ArchitectureMismatch {
                expected: graph.architecture().to_string(),
                found: self.architecture.to_string(),
            });
        }
        if self.mode != mode {
            return Err(PruneError::ArchitectureMismatch {
                expected: format!("{mode} mask"),
                found: format!("{} mask", self.mode),
            });
        }
        Ok(())
    }

    /// Parameters in mask order; every element id must be present exactly once
    pub fn ordered_parameters(&self, graph: &GraphDescriptor) -> Result<Vec<Vec<f32>>> {
        let ids = graph.element_ids(self.mode);
        if self.parameters.len() != ids.len() {
            return Err(PruneError::ShapeMismatch {
                what: "checkpoint parameters".into(),
                expected: ids.len(),
                got: self.parameters.len(),
            });
        }
        ids.iter()
            .map(|id| {
                self.parameters.get(id).cloned().ok_or_else(|| match self.mode {
                    PruningMode::Vertex => PruneError::UnknownVertex(id.clone()),
                    PruningMode::Edge => PruneError::UnknownEdge(id.clone()),
                })
            })
            .collect()
    }

    /// Load parameters and constants into a pruner.
    ///
    /// On error the pruner is left unchanged.
    pub fn restore<P: Pruner + ?Sized>(&self, pruner: &mut P) -> Result<()> {
        self.check_compatible(pruner.graph(), pruner.mode())?;
        if self.sampler != pruner.sampler().kind() {
            return Err(PruneError::Config(format!(
                "checkpoint holds a {} sampler, pruner has {}",
                self.sampler,
                pruner.sampler().kind()
            )));
        }
        let ordered = self.ordered_parameters(pruner.graph())?;
        pruner
            .constants()
            .check_map(pruner.graph(), &self.constants)?;

        pruner.sampler_mut().load_parameters(&ordered)?;
        let graph = pruner.graph().clone();
        pruner.constants_mut().load_map(&graph, &self.constants)?;
        info!("Restored {} {} parameters", ordered.len(), self.sampler);
        Ok(())
    }

    /// Rebuild a standalone sampler holding the saved parameters
    pub fn build_sampler(&self, graph: &GraphDescriptor, device: &Device) -> Result<Box<dyn MaskSampler>> {
        self.check_compatible(graph, self.mode)?;
        let ordered = self.ordered_parameters(graph)?;
        let n = ordered.len();
        let mut sampler: Box<dyn MaskSampler> = match self.sampler.as_str() {
            "hcgs" => Box::new(HardConcreteSampler::new(n, &self.config, device)?),
            "ugs" => Box::new(UniformWindowSampler::new(n, &self.config, device)?),
            "constant" => Box::new(ConstantSampler::ones(n, device)?),
            other => {
                return Err(PruneError::Config(format!(
                    "cannot rebuild sampler kind '{other}'"
                )))
            }
        };
        sampler.load_parameters(&ordered)?;
        Ok(sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ablation::AblationConstants;
    use crate::pruner::VertexPruner;
    use crate::toy::ToyTransformer;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn setup() -> (ToyTransformer, Arc<GraphDescriptor>) {
        let arch = ArchitectureConfig::new(2, 2);
        let model = ToyTransformer::random(arch.clone(), 4, 1, &Device::Cpu).unwrap();
        (model, Arc::new(GraphDescriptor::new(arch).unwrap()))
    }

    fn hcgs_pruner<'m>(
        model: &'m ToyTransformer,
        graph: &Arc<GraphDescriptor>,
        logits: Vec<f32>,
    ) -> VertexPruner<'m, ToyTransformer> {
        let config = PruningConfig::default();
        let sampler = HardConcreteSampler::with_logits(logits, &config, &Device::Cpu).unwrap();
        let constants =
            AblationConstants::zeros(graph, PruningMode::Vertex, 4, &Device::Cpu).unwrap();
        VertexPruner::new(model, graph.clone(), Box::new(sampler), constants).unwrap()
    }

    #[test]
    fn test_save_load_restore() {
        let (model, graph) = setup();
        let config = PruningConfig::default();
        let mut source = hcgs_pruner(&model, &graph, vec![3.0, -3.0, 0.5, 2.0, -1.0, 0.0]);
        source
            .constants_mut()
            .insert(crate::graph::VertexId::mlp(1), &[1.0, 2.0, 3.0, 4.0])
            .unwrap();

        let checkpoint = MaskCheckpoint::capture(&source, &config).unwrap();
        assert_eq!(checkpoint.parameters["a0.0"], vec![3.0, 2.0 / 3.0]);

        let file = NamedTempFile::new().unwrap();
        checkpoint.save(file.path()).unwrap();
        let loaded = MaskCheckpoint::load(file.path()).unwrap();
        assert_eq!(loaded, checkpoint);

        let mut target = hcgs_pruner(&model, &graph, vec![0.0; 6]);
        loaded.restore(&mut target).unwrap();
        assert_eq!(
            target.sampler().parameters().unwrap(),
            source.sampler().parameters().unwrap()
        );
        assert_eq!(target.constants().to_map().unwrap()["m1"], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_architecture_mismatch_changes_nothing() {
        let (model, graph) = setup();
        let mut checkpoint = MaskCheckpoint::capture(
            &hcgs_pruner(&model, &graph, vec![1.0; 6]),
            &PruningConfig::default(),
        )
        .unwrap();
        checkpoint.architecture = ArchitectureConfig::new(3, 2);

        let mut target = hcgs_pruner(&model, &graph, vec![0.0; 6]);
        let before = target.sampler().parameters().unwrap();
        assert!(matches!(
            checkpoint.restore(&mut target),
            Err(PruneError::ArchitectureMismatch { .. })
        ));
        assert_eq!(target.sampler().parameters().unwrap(), before);
    }

    #[test]
    fn test_missing_or_bad_entries_change_nothing() {
        let (model, graph) = setup();
        let checkpoint = MaskCheckpoint::capture(
            &hcgs_pruner(&model, &graph, vec![1.0; 6]),
            &PruningConfig::default(),
        )
        .unwrap();
        let mut target = hcgs_pruner(&model, &graph, vec![0.0; 6]);
        let before = target.sampler().parameters().unwrap();

        let mut missing = checkpoint.clone();
        missing.parameters.remove("m0");
        assert!(missing.restore(&mut target).is_err());

        let mut bad_constant = checkpoint.clone();
        bad_constant.constants.insert("a0.0".into(), vec![1.0]);
        assert!(bad_constant.restore(&mut target).is_err());

        let mut wrong_mode = checkpoint;
        wrong_mode.mode = PruningMode::Edge;
        assert!(wrong_mode.restore(&mut target).is_err());

        assert_eq!(target.sampler().parameters().unwrap(), before);
    }

    #[test]
    fn test_build_sampler_resolves_saved_mask() {
        let (model, graph) = setup();
        let checkpoint = MaskCheckpoint::capture(
            &hcgs_pruner(&model, &graph, vec![10.0, -10.0, 10.0, -10.0, 10.0, -10.0]),
            &PruningConfig::default(),
        )
        .unwrap();
        let sampler = checkpoint.build_sampler(&graph, &Device::Cpu).unwrap();
        let mask: Vec<f32> = sampler.resolve().unwrap().to_vec1().unwrap();
        assert_eq!(mask, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
    }
}
