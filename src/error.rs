//! Error taxonomy shared by the storage substrate and the solvers.
//!
//! Shape, bounds and lookup errors surface to the caller of the violating
//! operation. [`ComputeError::NumericInconsistency`] marks an invariant
//! violation inside a sweep; the sweep stops and the run is aborted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("index {index:?} out of bounds for shape {shape:?}")]
    OutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("non-finite {quantity} at timestep {timestep}, state {state}")]
    NumericInconsistency {
        quantity: &'static str,
        timestep: usize,
        state: usize,
    },

    #[error("cannot reduce over an array with no materialized entries")]
    EmptyReduction,

    #[error("invalid MDP: {0}")]
    InvalidMdp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ComputeError>;
