//! Error types for dagflow-core.

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Surface error kinds. Names are stable: callers are expected to match on
/// them, not just display the message.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("cell not found: {0}")]
    NodeNotFound(usize),

    #[error("adding this edge would create a cycle through cell {0}")]
    CycleDetected(usize),

    #[error("cell {0} cannot depend on itself")]
    SelfDependency(usize),

    #[error("unknown dependency: cell {0} does not exist")]
    UnknownDependency(usize),

    #[error("type mismatch on cell {cell}: expected {expected}, found {found}")]
    TypeMismatch {
        cell: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("reentrant access: cell {0} was read while it was still computing")]
    ReentrancyDetected(usize),

    #[error("compute failed for cell {cell}: {source}")]
    ComputeFailed { cell: usize, source: Arc<anyhow::Error> },

    #[error("engine has been disposed")]
    Disposed,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub(crate) fn compute_failed(cell: usize, source: anyhow::Error) -> Self {
        EngineError::ComputeFailed { cell, source: Arc::new(source) }
    }
}
