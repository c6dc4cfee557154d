//! Construction surface for [`AutoEncoder`](crate::AutoEncoder).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, ConfigError};
use crate::layers::CellKind;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEncoderConfig {
    pub vocab_size: usize,
    pub max_length: usize,
    /// Decoder hidden size, and the latent width a decoder accepts.
    pub rnn_size: usize,
    /// Encoder hidden size. Falls back to `rnn_size`.
    pub encoder_size: Option<usize>,
    pub embedding_size: usize,
    pub encoder: bool,
    pub decoder: bool,
    /// Enables training when both halves are built.
    pub learning_rate: Option<f32>,
    pub variational: bool,
    /// When false the decoder input is the code alone, with no previous-token embedding.
    pub use_teacher_forcing: bool,
    pub reverse_encoder_input: bool,
    pub save_dir: Option<PathBuf>,
    pub load_from_save: bool,
    pub cell: CellKind,
    pub seed: u64,
    pub max_to_keep: usize,
    pub max_grad_norm: Option<f32>,
    pub weight_decay: f32,
    /// Draw epsilon for the variational code on training passes.
    pub sample_latent: bool,
}

impl Default for AutoEncoderConfig {
    fn default() -> Self {
        AutoEncoderConfig {
            vocab_size: 0,
            max_length: 20,
            rnn_size: 500,
            encoder_size: None,
            embedding_size: 200,
            encoder: true,
            decoder: true,
            learning_rate: None,
            variational: false,
            use_teacher_forcing: true,
            reverse_encoder_input: true,
            save_dir: None,
            load_from_save: false,
            cell: CellKind::Gru,
            seed: 0,
            max_to_keep: 10,
            max_grad_norm: None,
            weight_decay: 0.0,
            sample_latent: true,
        }
    }
}

/// Which halves an instance owns. A decoder-only model always reads codes supplied by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    EncodeOnly,
    DecodeOnly,
    Full,
}

impl Mode {
    pub fn has_encoder(self) -> bool { matches!(self, Mode::EncodeOnly | Mode::Full) }
    pub fn has_decoder(self) -> bool { matches!(self, Mode::DecodeOnly | Mode::Full) }
}

impl AutoEncoderConfig {
    pub fn new(vocab_size: usize, max_length: usize) -> Self {
        AutoEncoderConfig { vocab_size, max_length, ..Default::default() }
    }

    pub fn encoder_width(&self) -> usize {
        self.encoder_size.unwrap_or(self.rnn_size)
    }

    /// Latent width exposed by `encode` or accepted by `decode`.
    pub fn latent_size(&self) -> usize {
        if self.encoder { self.encoder_width() } else { self.rnn_size }
    }

    pub fn is_trainable(&self) -> bool {
        self.encoder && self.decoder && self.learning_rate.is_some()
    }

    /// Checks every field and resolves the build mode.
    pub fn validate(&self) -> Result<Mode, ConfigError> {
        let mode = match (self.encoder, self.decoder) {
            (false, false) => return Err(ConfigError::NothingToBuild),
            (true, false) => Mode::EncodeOnly,
            (false, true) => Mode::DecodeOnly,
            (true, true) => Mode::Full,
        };

        let sizes = [
            ("vocab_size", self.vocab_size),
            ("max_length", self.max_length),
            ("rnn_size", self.rnn_size),
            ("embedding_size", self.embedding_size),
            ("max_to_keep", self.max_to_keep),
        ];
        for (field, v) in sizes {
            if v == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.encoder_size == Some(0) {
            return Err(ConfigError::invalid("encoder_size", "must be greater than zero"));
        }
        if mode == Mode::Full && self.encoder_width() != self.rnn_size {
            return Err(ConfigError::LatentSizeMismatch { encoder: self.encoder_width(), decoder: self.rnn_size });
        }
        if let Some(lr) = self.learning_rate {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(ConfigError::invalid("learning_rate", format!("{} is not a positive finite rate", lr)));
            }
        }
        if let Some(norm) = self.max_grad_norm {
            if !norm.is_finite() || norm <= 0.0 {
                return Err(ConfigError::invalid("max_grad_norm", format!("{} is not a positive finite norm", norm)));
            }
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ConfigError::invalid("weight_decay", "must be finite and non-negative"));
        }
        if self.load_from_save && self.save_dir.is_none() {
            return Err(ConfigError::invalid("save_dir", "required when load_from_save is set"));
        }
        Ok(mode)
    }

    pub fn save(&self, dir: &Path) -> Result<(), CheckpointError> {
        let path = dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| CheckpointError::io(&path, e))
    }

    /// Reads the config written alongside checkpoints in `dir`.
    pub fn load(dir: &Path) -> Result<Self, CheckpointError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Err(CheckpointError::NotFound { dir: dir.to_path_buf() });
        }
        let text = fs::read_to_string(&path).map_err(|e| CheckpointError::io(&path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> AutoEncoderConfig {
        AutoEncoderConfig { rnn_size: 8, embedding_size: 4, ..AutoEncoderConfig::new(10, 5) }
    }

    #[test]
    fn resolves_modes() {
        assert_eq!(small().validate().unwrap(), Mode::Full);
        let enc = AutoEncoderConfig { decoder: false, ..small() };
        assert_eq!(enc.validate().unwrap(), Mode::EncodeOnly);
        let dec = AutoEncoderConfig { encoder: false, ..small() };
        assert_eq!(dec.validate().unwrap(), Mode::DecodeOnly);
    }

    #[test]
    fn rejects_empty_model() {
        let cfg = AutoEncoderConfig { encoder: false, decoder: false, ..small() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NothingToBuild)));
    }

    #[test]
    fn rejects_mismatched_latent_only_when_both_halves_exist() {
        let full = AutoEncoderConfig { encoder_size: Some(6), ..small() };
        assert!(matches!(full.validate(), Err(ConfigError::LatentSizeMismatch { encoder: 6, decoder: 8 })));

        let enc = AutoEncoderConfig { decoder: false, ..full.clone() };
        assert!(enc.validate().is_ok());
        assert_eq!(enc.latent_size(), 6);
    }

    #[test]
    fn rejects_bad_numbers() {
        let lr = AutoEncoderConfig { learning_rate: Some(-1.0), ..small() };
        assert!(matches!(lr.validate(), Err(ConfigError::InvalidValue { field: "learning_rate", .. })));
        let vocab = AutoEncoderConfig { vocab_size: 0, ..small() };
        assert!(matches!(vocab.validate(), Err(ConfigError::InvalidValue { field: "vocab_size", .. })));
        let load = AutoEncoderConfig { load_from_save: true, ..small() };
        assert!(matches!(load.validate(), Err(ConfigError::InvalidValue { field: "save_dir", .. })));
    }

    #[test]
    fn json_round_trip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AutoEncoderConfig { variational: true, cell: CellKind::Lstm, learning_rate: Some(0.01), ..small() };
        cfg.save(dir.path()).unwrap();
        assert_eq!(AutoEncoderConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: AutoEncoderConfig = serde_json::from_str(r#"{"vocab_size": 12}"#).unwrap();
        assert_eq!(cfg.vocab_size, 12);
        assert_eq!(cfg.max_to_keep, 10);
        assert!(cfg.use_teacher_forcing);
    }
}
