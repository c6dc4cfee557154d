//! Recurrent sequence autoencoder over fixed-length token-index sequences.
//!
//! An [`AutoEncoder`] is built as encode-only, decode-only or full. A full instance with a
//! learning rate trains with teacher forcing and, when variational, an annealed KL term.
//! Codes are plain `(N, D)` arrays, so the two halves can be trained together, saved, and
//! restored into separate instances scope by scope.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod params;
pub mod tensor;
pub mod trainer;

pub use batch::{BatchGenerator, Batchable};
pub use checkpoint::CheckpointManager;
pub use config::{AutoEncoderConfig, Mode};
pub use error::{CheckpointError, ConfigError, Error, Result, ShapeError};
pub use layers::CellKind;
pub use model::{AutoEncoder, DecodedBatch, EpochStats, LossReport, TrainOptions, TrainReport};
pub use params::{DECODER, EMBEDDINGS, ENCODER};
pub use trainer::KlSchedule;
