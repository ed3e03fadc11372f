//! Error types for the Telos framework.
//!
//! This module provides a unified error type for all operations in the Telos
//! framework, using the `thiserror` crate for ergonomic error handling.
//!
//! Every failure here is a programmer-facing contract violation: nothing is
//! retried and nothing is fatal to the process. Errors propagate to the
//! orchestration layer, which decides whether to abort a batch or a run.

use thiserror::Error;

/// The main error type for Telos operations.
#[derive(Error, Debug)]
pub enum TelosError {
    /// A guarded operation was invoked before its prerequisite ran for the
    /// same `(machine, input)` pair.
    #[error("`{op}` requires `{requires}` to have been called first")]
    PreconditionNotMet {
        /// The operation that was attempted
        op: &'static str,
        /// The operation that must run first
        requires: &'static str,
    },

    /// A connection was added to a pipeline out of chain order.
    #[error("connections in a pipeline must be added in sequence")]
    OutOfSequence,

    /// A target override points at or before its own position in the chain.
    #[error("cannot target a value at or before its own position in the pipeline")]
    NonCausalTarget,

    /// The referenced output IO was never recorded in the container.
    #[error("output has not been recorded in the container")]
    UnknownOutput,

    /// A reverse traversal was started while another pass was in progress.
    #[error("a reverse traversal is already in progress")]
    TraversalInProgress,

    /// A node was visited before its target could be resolved.
    #[error("target for a connection could not be resolved during reverse traversal")]
    UnresolvedTarget,

    /// No value cached in state under the requested field.
    #[error("no value cached in state for field `{0}`")]
    MissingState(&'static str),

    /// A gradient was read before anything wrote it.
    #[error("gradient has not been computed for value {0}")]
    MissingGrad(usize),

    /// Value index out of bounds for an IO.
    #[error("value index out of range: index {index}, length {length}")]
    IndexOutOfRange {
        /// The index that was accessed
        index: usize,
        /// The valid length
        length: usize,
    },

    /// IOs of different value counts cannot be concatenated element-wise.
    #[error("cannot concatenate IOs of different lengths: {0} vs {1}")]
    CatLengthMismatch(usize, usize),

    /// Invalid parameter or configuration value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported by this container kind.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Shape error propagated from the tensor substrate.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Config parse error occurred.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

/// A specialized `Result` type for Telos operations.
///
/// This is a type alias for `Result<T, TelosError>` and is used throughout
/// the Telos codebase for consistency.
pub type Result<T> = std::result::Result<T, TelosError>;
