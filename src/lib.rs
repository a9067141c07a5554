// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→f32 for tensor scalars
#![allow(clippy::many_single_char_names)] // x, p, q, s standard in math
#![allow(clippy::similar_names)] // related variables like `edge`/`edges`
#![allow(clippy::module_name_repetitions)] // PruneError in error.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling

//! circuit-prune: optimal-ablation circuit discovery
//!
//! Learns which components (vertices) or connections (edges) of a
//! transformer a behavior depends on. A stochastic mask decides, per pass,
//! how much of each element is kept; pruned elements are replaced by
//! learnable ablation constants instead of zero.
//!
//! ## Architecture
//!
//! - `graph`: Vertex/edge taxonomy of a fixed-shape transformer
//! - `config`: Pruning hyperparameters (JSON, defaults, validation)
//! - `hooks`: Named interception points and the per-pass hook trait
//! - `cache`: Per-pass vertex output cache for edge pruning
//! - `model`: `ComponentModel` trait for the network and graph traversal
//! - `sampler`: `MaskSampler` trait, constant and single-component masks
//! - `hard_concrete`: Hard-concrete gradient sampler (HCGS)
//! - `uniform_window`: Uniform-window gradient sampler (UGS)
//! - `ablation`: Learnable per-vertex ablation constants
//! - `pruner`: Shared pruner plumbing and the vertex pruner
//! - `edge_pruner`: Edge pruner reconstructing inputs from cached outputs
//! - `train`: AdamW wiring for masks and constants
//! - `circuit`: Thresholding, dangling-edge removal, circuit JSON
//! - `checkpoint`: Sampler and constant persistence keyed by element id
//! - `eval`: KL against the unpruned network, circuit evaluation
//! - `toy`: Small deterministic transformer for tests and demos

pub mod ablation;
pub mod cache;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod edge_pruner;
pub mod error;
pub mod eval;
pub mod graph;
pub mod hard_concrete;
pub mod hooks;
pub mod model;
pub mod pruner;
pub mod sampler;
pub mod toy;
pub mod train;
pub mod uniform_window;

pub use ablation::AblationConstants;
pub use cache::EdgeActivationCache;
pub use checkpoint::MaskCheckpoint;
pub use circuit::{
    discretize, mask_to_circuit, mask_values, prune_dangling_edges, threshold_indices, Circuit,
};
pub use config::{PruningConfig, WindowSchedule};
pub use edge_pruner::EdgePruner;
pub use error::{PruneError, Result};
pub use eval::{
    evaluate_circuit, evaluate_mask, kl_divergence, kl_loss, mean_kl, mse_loss,
    single_component_sweep, CircuitEvaluation, ComponentImportance,
};
pub use graph::{ArchitectureConfig, EdgeId, GraphDescriptor, InputSlot, PruningMode, VertexId};
pub use hard_concrete::{HardConcreteSampler, MaskStats, DEFAULT_TEMPERATURE};
pub use hooks::{HookAction, HookPoint, HookRegistry, NoHooks, PassHooks};
pub use model::{run_graph, run_unhooked, select_device, ComponentModel, VertexInputs};
pub use pruner::{PrunedOutput, Pruner, VertexPruner};
pub use sampler::{ConstantSampler, MaskSampler, SamplerMode, SingleComponentSampler};
pub use toy::ToyTransformer;
pub use train::{PruningOptimizer, StepReport};
pub use uniform_window::UniformWindowSampler;
