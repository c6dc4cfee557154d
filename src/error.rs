//! Error types for construction, checkpointing and batch/shape handling.

use std::path::PathBuf;

use thiserror::Error;

/// Rejected model configuration. Raised before any parameter is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one of encoder or decoder must be requested")]
    NothingToBuild,

    #[error("latent size mismatch: encoder produces {encoder}, decoder expects {decoder}")]
    LatentSizeMismatch { encoder: usize, decoder: usize },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("operation `{operation}` requires {requirement}")]
    Unsupported { operation: &'static str, requirement: &'static str },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue { field, message: message.into() }
    }

    pub fn unsupported(operation: &'static str, requirement: &'static str) -> Self {
        Self::Unsupported { operation, requirement }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found in {}", dir.display())]
    NotFound { dir: PathBuf },

    #[error("scope `{scope}` has no trainable parameters")]
    EmptyScope { scope: String },

    #[error("checkpoint step {step} has no parameter `{scope}/{name}`")]
    MissingParameter { step: u64, scope: String, name: String },

    #[error("shape mismatch for `{scope}/{name}`: model has {expected:?}, checkpoint has {actual:?}")]
    ShapeMismatch {
        scope: String,
        name: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("no save directory configured")]
    NoSaveDir,

    #[error("checkpoint I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint index is malformed: {0}")]
    Index(#[from] serde_json::Error),

    #[error("checkpoint snapshot is malformed: {0}")]
    Snapshot(#[from] bincode::Error),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Caller data that does not fit the model or the batching contract.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("parallel arrays disagree on leading dimension: {first} vs {other}")]
    LeadingDimMismatch { first: usize, other: usize },

    #[error("expected {expected} columns, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("token {token} at ({row}, {col}) is outside vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, row: usize, col: usize, vocab_size: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("non-finite loss at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
