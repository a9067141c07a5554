//! Error taxonomy for circuit-prune
//!
//! Every variant is structural misuse or a numeric defect; nothing here is
//! transient, so callers get the error back unchanged and decide whether to
//! abort the run.

use thiserror::Error;

/// Errors raised by samplers, pruners, circuit utilities and persistence.
#[derive(Debug, Error)]
pub enum PruneError {
    /// A vertex id that the graph descriptor does not enumerate
    #[error("unknown vertex: {0}")]
    UnknownVertex(String),

    /// An edge id that the graph descriptor does not enumerate
    #[error("unknown edge: {0}")]
    UnknownEdge(String),

    /// Mask, parameter or tensor size disagrees with the graph
    #[error("{what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// A source vertex can be ablated but has no ablation constant
    #[error("missing ablation constant for {0}")]
    MissingAblationConstant(String),

    /// The edge pruner read a vertex that was not cached in this pass
    #[error("vertex {0} read before it was cached in this pass")]
    UncachedVertex(String),

    /// Hooks installed in the wrong order, or a pass run with incomplete hooks
    #[error("hook order: {0}")]
    HookOrder(String),

    /// A checkpoint produced for a different graph or pruning mode
    #[error("architecture mismatch: expected {expected}, found {found}")]
    ArchitectureMismatch { expected: String, found: String },

    /// NaN or out-of-range value escaped the sampling distribution
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Invalid configuration value
    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, PruneError>;
