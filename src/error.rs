use thiserror::Error;

/// Errors reported by model construction, parameter access and training.
///
/// Impossible paths are not errors: a weight of negative infinity encodes a
/// structurally forbidden transition and propagates additively through the
/// lattices. Numerical-invariant violations (NaN in parameters or
/// statistics) are programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A state with this name was already added to the transducer.
    #[error("duplicate state name `{0}`")]
    DuplicateState(String),

    /// A transition names a destination state that does not exist.
    #[error("unknown destination state `{0}`")]
    UnknownState(String),

    /// A transition references a weight group outside the weight table.
    #[error("weight group {index} out of bounds (table has {len} groups)")]
    WeightGroupOutOfBounds { index: usize, len: usize },

    /// A buffer or sequence has the wrong length.
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A label-transition pattern constraint could not be parsed.
    #[error("malformed label pattern `{0}`")]
    MalformedPattern(String),

    /// A configuration value is out of range or otherwise invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The external optimizer failed before completing a single iteration.
    #[error("optimizer failure: {0}")]
    Optimizer(String),

    /// Reserved functionality that this model family does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
