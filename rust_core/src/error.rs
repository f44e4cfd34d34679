use thiserror::Error;

/// Invalid problem setup. Raised before any numeric work and never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("image is not square: {rows}x{cols}")]
    NonSquareImage { rows: usize, cols: usize },

    #[error("grid size must be at least 1")]
    EmptyGrid,

    #[error("grid size {size} exceeds the configured ceiling of {max}")]
    GridTooLarge { size: usize, max: usize },

    #[error("angle spec must be a single count or a (start, end, count) triple, got {0} values")]
    MalformedAngleSpec(usize),

    #[error("angle spec has an invalid count: {0}")]
    InvalidAngleCount(f64),

    #[error("regularization order {0} is not supported (expected 1 or 2)")]
    UnsupportedOrder(usize),

    #[error("unknown wavelet '{0}'")]
    UnknownWavelet(String),

    #[error("invalid hyperparameter {name} = {value}: {reason}")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("log density is not finite at the starting point")]
    NonFiniteStart,

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Top-level error for the reconstruction engine.
#[derive(Debug, Error)]
pub enum TomoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sparse operator construction failed: {0}")]
    Sparse(String),
}

pub type Result<T> = std::result::Result<T, TomoError>;
