// ============================================================================
// AUTOENCODER - model context: parameters, RNG, optimizer, checkpoints
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::BatchGenerator;
use crate::checkpoint::CheckpointManager;
use crate::config::{AutoEncoderConfig, Mode};
use crate::decoder::{Decoder, DecoderOutput};
use crate::encoder::{Encoder, EncoderOutput};
use crate::error::{CheckpointError, ConfigError, Error, Result, ShapeError};
use crate::layers::Embedding;
use crate::params::{ParamInit, ParamStore, DECODER, EMBEDDINGS, ENCODER};
use crate::tensor::{softmax_rows, Graph, TID};
use crate::trainer::{compose_loss, KlSchedule, Trainer};

pub struct TrainOptions<'a> {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub keep_prob: f32,
    /// Defaults to `KlSchedule::default()` for variational models.
    pub kl_schedule: Option<KlSchedule>,
    /// Mean batch loss is logged every this many batches.
    pub log_every: usize,
    pub validation: Option<ArrayView2<'a, usize>>,
}

impl Default for TrainOptions<'_> {
    fn default() -> Self {
        TrainOptions {
            num_epochs: 1,
            batch_size: 32,
            keep_prob: 1.0,
            kl_schedule: None,
            log_every: 200,
            validation: None,
        }
    }
}

/// Teacher-forced objective averaged over examples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    pub reconstruction: f32,
    /// Unweighted KL divergence; 0 for deterministic models.
    pub kl_divergence: f32,
    pub total: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochStats {
    /// Epochs completed by this instance, counting earlier `train` calls.
    pub epoch: usize,
    pub kl_weight: f32,
    pub train: LossReport,
    pub grad_norm: f32,
    pub validation: Option<LossReport>,
    pub seconds: f64,
}

#[derive(Clone, Debug)]
pub struct TrainReport {
    /// Training-pass predictions of the final epoch, in input order.
    pub predictions: Array2<usize>,
    pub epochs: Vec<EpochStats>,
}

/// Decoder output for a set of codes: `(N, L)` tokens and `(N, L, V)` scores.
#[derive(Clone, Debug)]
pub struct DecodedBatch {
    pub predictions: Array2<usize>,
    pub logits: Array3<f32>,
    pub probabilities: Array3<f32>,
}

#[derive(Default)]
struct LossSums {
    reconstruction: f64,
    kl_divergence: f64,
    total: f64,
    examples: usize,
}

impl LossSums {
    fn add(&mut self, g: &Graph, recon: TID, kl: Option<TID>, total: TID, examples: usize) {
        let w = examples as f64;
        self.reconstruction += g.data(recon)[0] as f64 * w;
        self.kl_divergence += kl.map_or(0.0, |k| g.data(k)[0] as f64) * w;
        self.total += g.data(total)[0] as f64 * w;
        self.examples += examples;
    }

    fn report(&self) -> LossReport {
        if self.examples == 0 { return LossReport::default(); }
        let n = self.examples as f64;
        LossReport {
            reconstruction: (self.reconstruction / n) as f32,
            kl_divergence: (self.kl_divergence / n) as f32,
            total: (self.total / n) as f32,
        }
    }
}

/// A sequence autoencoder instance. Owns its parameters, random generator, optimizer
/// state and checkpoint directory; nothing is shared between instances.
pub struct AutoEncoder {
    config: AutoEncoderConfig,
    mode: Mode,
    graph: Graph,
    params: ParamStore,
    rng: StdRng,
    embedding: Embedding,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
    trainer: Option<Trainer>,
    checkpoints: Option<CheckpointManager>,
    epochs_trained: usize,
}

impl AutoEncoder {
    pub fn new(config: AutoEncoderConfig) -> Result<Self> {
        let mode = config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut graph = Graph::new();
        let mut params = ParamStore::new();

        let embedding = Embedding::new(config.vocab_size, config.embedding_size,
            &mut ParamInit::new(&mut graph, &mut params, &mut rng, EMBEDDINGS));
        let encoder = mode.has_encoder().then(|| Encoder::new(
            config.embedding_size, config.encoder_width(), config.cell,
            config.variational, config.reverse_encoder_input,
            &mut ParamInit::new(&mut graph, &mut params, &mut rng, ENCODER),
        ));
        let decoder = mode.has_decoder().then(|| Decoder::new(
            config.rnn_size, config.embedding_size, config.max_length,
            config.cell, config.use_teacher_forcing,
            &mut ParamInit::new(&mut graph, &mut params, &mut rng, DECODER),
        ));
        graph.freeze_params();

        let trainer = match config.learning_rate {
            Some(lr) if config.is_trainable() => {
                Some(Trainer::new(lr, config.weight_decay, config.max_grad_norm, params.all_ids(), &graph))
            }
            Some(_) => {
                debug!(?mode, "learning rate ignored: training needs both encoder and decoder");
                None
            }
            None => None,
        };
        let checkpoints = config.save_dir.as_ref().map(|d| CheckpointManager::new(d, config.max_to_keep));
        if trainer.is_some() && checkpoints.is_none() {
            warn!("no save_dir configured; epoch checkpoints are disabled");
        }

        for scope in params.scopes() {
            info!(scope, params = params.scope(scope).len(), elements = params.num_elements(scope, &graph),
                "built parameter group");
        }
        info!(?mode, vocab = config.vocab_size, max_length = config.max_length,
            latent = config.latent_size(), variational = config.variational, "autoencoder ready");

        let mut model = AutoEncoder {
            config, mode, graph, params, rng, embedding, encoder, decoder, trainer, checkpoints,
            epochs_trained: 0,
        };
        if model.config.load_from_save {
            info!("loading from save");
            let mut step = model.restore_scope(EMBEDDINGS)?;
            if model.mode.has_encoder() { step = step.max(model.restore_scope(ENCODER)?); }
            if model.mode.has_decoder() { step = step.max(model.restore_scope(DECODER)?); }
            model.epochs_trained = step as usize;
        }
        Ok(model)
    }

    pub fn config(&self) -> &AutoEncoderConfig { &self.config }
    pub fn mode(&self) -> Mode { self.mode }
    pub fn latent_size(&self) -> usize { self.config.latent_size() }
    pub fn epochs_trained(&self) -> usize { self.epochs_trained }
    pub fn is_trainable(&self) -> bool { self.trainer.is_some() }

    // ------------------------------------------------------------------
    // Input validation
    // ------------------------------------------------------------------

    fn check_tokens(&self, tokens: &ArrayView2<usize>) -> Result<()> {
        let expected = self.config.max_length;
        if tokens.ncols() != expected {
            return Err(ShapeError::WidthMismatch { expected, actual: tokens.ncols() }.into());
        }
        let vocab_size = self.config.vocab_size;
        if let Some(((row, col), &token)) = tokens.indexed_iter().find(|(_, &t)| t >= vocab_size) {
            return Err(ShapeError::TokenOutOfRange { token, row, col, vocab_size }.into());
        }
        Ok(())
    }

    fn check_codes(&self, codes: &ArrayView2<f32>) -> Result<()> {
        let expected = self.config.latent_size();
        if codes.ncols() != expected {
            return Err(ShapeError::WidthMismatch { expected, actual: codes.ncols() }.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forward helpers, one batch each
    // ------------------------------------------------------------------

    fn encode_batch(&mut self, tokens: ArrayView2<usize>, keep_prob: f32, sample: bool) -> Result<EncoderOutput> {
        let encoder = self.encoder.as_ref().ok_or(ConfigError::unsupported("encode", "an encoder"))?;
        Ok(encoder.forward(&mut self.graph, &self.embedding, tokens, keep_prob, sample, &mut self.rng))
    }

    fn decode_batch(&mut self, code: TID, labels: Option<ArrayView2<usize>>, training: bool) -> Result<DecoderOutput> {
        let decoder = self.decoder.as_ref().ok_or(ConfigError::unsupported("decode", "a decoder"))?;
        Ok(decoder.forward(&mut self.graph, &self.embedding, code, labels, training))
    }

    fn code_constant(&mut self, codes: ArrayView2<f32>) -> TID {
        let data: Vec<f32> = codes.iter().copied().collect();
        self.graph.constant(data, codes.nrows(), codes.ncols())
    }

    fn write_rows(out: &mut Array2<f32>, start: usize, data: &[f32]) {
        let width = out.ncols();
        for (r, row) in data.chunks(width.max(1)).enumerate() {
            out.row_mut(start + r).assign(&ArrayView1::from(row));
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Maps `(N, L)` token sequences to `(N, D)` codes. No dropout, no sampling.
    pub fn encode(&mut self, sequences: ArrayView2<usize>, batch_size: Option<usize>) -> Result<Array2<f32>> {
        if !self.mode.has_encoder() {
            return Err(ConfigError::unsupported("encode", "an encoder").into());
        }
        self.check_tokens(&sequences)?;
        let width = self.latent_size();
        let mut out = Array2::<f32>::zeros((sequences.nrows(), width));
        let mut start = 0;
        for batch in BatchGenerator::with_optional_size(sequences, batch_size)? {
            if batch.nrows() == 0 { continue; }
            self.graph.reset();
            let enc = self.encode_batch(batch, 1.0, false)?;
            Self::write_rows(&mut out, start, self.graph.data(enc.code));
            start += batch.nrows();
        }
        self.graph.reset();
        Ok(out)
    }

    /// Free-running decode of externally supplied codes. Decoder-only instances.
    pub fn decode(&mut self, codes: ArrayView2<f32>, batch_size: Option<usize>) -> Result<Array2<usize>> {
        self.run_decode(codes, batch_size, |_, _, _| {})
    }

    /// Like [`decode`](Self::decode), also returning per-step logits and probabilities.
    pub fn decode_with_scores(&mut self, codes: ArrayView2<f32>, batch_size: Option<usize>) -> Result<DecodedBatch> {
        let (n, l, v) = (codes.nrows(), self.config.max_length, self.config.vocab_size);
        let mut logits = Array3::<f32>::zeros((n, l, v));
        let mut probabilities = Array3::<f32>::zeros((n, l, v));
        let predictions = self.run_decode(codes, batch_size, |graph, start, out| {
            let rows = out.predictions.nrows();
            for (i, &step) in out.logits.iter().enumerate() {
                let raw = graph.data(step);
                let soft = softmax_rows(raw, v);
                for b in 0..rows {
                    let src = b * v..(b + 1) * v;
                    logits.slice_mut(s![start + b, i, ..]).assign(&ArrayView1::from(&raw[src.clone()]));
                    probabilities.slice_mut(s![start + b, i, ..]).assign(&ArrayView1::from(&soft[src]));
                }
            }
        })?;
        Ok(DecodedBatch { predictions, logits, probabilities })
    }

    /// Decodes batch by batch; `on_batch` sees the live graph, the first row index and the batch output.
    fn run_decode(
        &mut self, codes: ArrayView2<f32>, batch_size: Option<usize>,
        mut on_batch: impl FnMut(&Graph, usize, &DecoderOutput),
    ) -> Result<Array2<usize>> {
        if self.mode != Mode::DecodeOnly {
            return Err(ConfigError::unsupported("decode", "a decoder-only model").into());
        }
        self.check_codes(&codes)?;
        let mut predictions = Array2::<usize>::zeros((codes.nrows(), self.config.max_length));

        let mut start = 0;
        for batch in BatchGenerator::with_optional_size(codes, batch_size)? {
            let rows = batch.nrows();
            if rows == 0 { continue; }
            self.graph.reset();
            let code = self.code_constant(batch);
            let out = self.decode_batch(code, None, false)?;
            predictions.slice_mut(s![start..start + rows, ..]).assign(&out.predictions);
            on_batch(&self.graph, start, &out);
            start += rows;
        }
        self.graph.reset();
        Ok(predictions)
    }

    /// Encodes then decodes each batch in one pass, free-running.
    pub fn reconstruct(&mut self, sequences: ArrayView2<usize>, batch_size: Option<usize>) -> Result<Array2<usize>> {
        if self.mode != Mode::Full {
            return Err(ConfigError::unsupported("reconstruct", "both encoder and decoder").into());
        }
        self.check_tokens(&sequences)?;
        let mut out = Array2::<usize>::zeros(sequences.dim());
        let mut start = 0;
        for batch in BatchGenerator::with_optional_size(sequences, batch_size)? {
            let rows = batch.nrows();
            if rows == 0 { continue; }
            self.graph.reset();
            let enc = self.encode_batch(batch, 1.0, false)?;
            let dec = self.decode_batch(enc.code, None, false)?;
            out.slice_mut(s![start..start + rows, ..]).assign(&dec.predictions);
            start += rows;
        }
        self.graph.reset();
        Ok(out)
    }

    /// Teacher-forced loss with no dropout and no sampling.
    pub fn evaluate(&mut self, sequences: ArrayView2<usize>, batch_size: Option<usize>, kl_weight: f32) -> Result<LossReport> {
        if self.mode != Mode::Full {
            return Err(ConfigError::unsupported("evaluate", "both encoder and decoder").into());
        }
        self.check_tokens(&sequences)?;
        let mut sums = LossSums::default();
        for batch in BatchGenerator::with_optional_size(sequences, batch_size)? {
            if batch.nrows() == 0 { continue; }
            self.graph.reset();
            let enc = self.encode_batch(batch, 1.0, false)?;
            let dec = self.decode_batch(enc.code, Some(batch), true)?;
            let terms = compose_loss(&mut self.graph, &dec.logits, batch, enc.posterior(), kl_weight);
            sums.add(&self.graph, terms.reconstruction, terms.kl_divergence, terms.total, batch.nrows());
        }
        self.graph.reset();
        Ok(sums.report())
    }

    /// Teacher-forced training over `sequences`, one checkpoint per epoch when a save directory is set.
    pub fn train(&mut self, sequences: ArrayView2<usize>, options: &TrainOptions) -> Result<TrainReport> {
        if self.trainer.is_none() {
            return Err(ConfigError::unsupported("train", "encoder, decoder and a learning rate").into());
        }
        if !(options.keep_prob > 0.0 && options.keep_prob <= 1.0) {
            return Err(ConfigError::invalid("keep_prob", format!("{} is outside (0, 1]", options.keep_prob)).into());
        }
        self.check_tokens(&sequences)?;
        if let Some(val) = options.validation.as_ref() {
            self.check_tokens(val)?;
        }

        let schedule = options.kl_schedule.unwrap_or_default();
        let sample = self.config.variational && self.config.sample_latent;
        let log_every = options.log_every.max(1);
        let mut predictions = Array2::<usize>::zeros((0, self.config.max_length));
        let mut epochs = Vec::with_capacity(options.num_epochs);

        for epoch in 0..options.num_epochs {
            let t0 = Instant::now();
            let kl_weight = schedule.weight(epoch);
            if self.config.variational {
                debug!(epoch, kl_weight, "kl multiplier");
            }
            let mut epoch_preds = Array2::<usize>::zeros(sequences.dim());
            let mut sums = LossSums::default();
            let mut grad_norm_sum = 0.0f32;
            let mut interval_losses: Vec<f32> = Vec::new();
            let mut start = 0;
            let mut updates = 0usize;

            for (batch_index, batch) in BatchGenerator::new(sequences, options.batch_size)?.enumerate() {
                let rows = batch.nrows();
                if rows == 0 { continue; }
                self.graph.reset();
                let enc = self.encode_batch(batch, options.keep_prob, sample)?;
                let dec = self.decode_batch(enc.code, Some(batch), true)?;
                let terms = compose_loss(&mut self.graph, &dec.logits, batch, enc.posterior(), kl_weight);

                let loss = self.graph.data(terms.total)[0];
                if !loss.is_finite() {
                    self.graph.reset();
                    return Err(Error::NonFiniteLoss { epoch: self.epochs_trained, batch: batch_index });
                }
                sums.add(&self.graph, terms.reconstruction, terms.kl_divergence, terms.total, rows);
                if let Some(trainer) = self.trainer.as_mut() {
                    grad_norm_sum += trainer.update(&mut self.graph, terms.total);
                }
                updates += 1;

                epoch_preds.slice_mut(s![start..start + rows, ..]).assign(&dec.predictions);
                start += rows;

                interval_losses.push(loss);
                if batch_index % log_every == 0 {
                    let mean = interval_losses.iter().sum::<f32>() / interval_losses.len() as f32;
                    debug!(epoch, batch = batch_index, loss = mean, "batch loss");
                    interval_losses.clear();
                }
            }
            self.graph.reset();
            self.epochs_trained += 1;

            let validation = match options.validation {
                Some(val) => Some(self.evaluate(val, Some(options.batch_size), kl_weight)?),
                None => None,
            };
            let train = sums.report();
            let stats = EpochStats {
                epoch: self.epochs_trained,
                kl_weight,
                train,
                grad_norm: grad_norm_sum / updates.max(1) as f32,
                validation,
                seconds: t0.elapsed().as_secs_f64(),
            };
            info!(epoch = stats.epoch, loss = train.total, reconstruction = train.reconstruction,
                kl = train.kl_divergence, kl_weight, val_loss = validation.map(|v| v.total),
                "epoch complete");

            if self.checkpoints.is_some() {
                self.save_checkpoint(self.epochs_trained as u64)?;
            }
            epochs.push(stats);
            predictions = epoch_preds;
        }
        Ok(TrainReport { predictions, epochs })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Snapshots every parameter group at `step` and writes the config next to it.
    pub fn save_checkpoint(&mut self, step: u64) -> Result<PathBuf> {
        let mgr = self.checkpoints.as_ref().ok_or(CheckpointError::NoSaveDir)?;
        let path = mgr.save(step, &self.params, &self.graph)?;
        self.config.save(mgr.dir())?;
        Ok(path)
    }

    /// Loads one parameter group from the latest checkpoint. Returns the step it came from.
    pub fn restore_scope(&mut self, scope: &str) -> Result<u64> {
        let mgr = self.checkpoints.as_ref().ok_or(CheckpointError::NoSaveDir)?;
        Ok(mgr.restore(scope, &self.params, &mut self.graph)?)
    }

    /// Current values of one parameter group, keyed by parameter name.
    pub fn parameter_values(&self, scope: &str) -> BTreeMap<String, Array2<f32>> {
        self.params.scope(scope).iter()
            .map(|(name, id)| {
                let (rows, cols) = self.graph.shape(*id);
                let data = self.graph.data(*id);
                (name.clone(), Array2::from_shape_fn((rows, cols), |(i, j)| data[i * cols + j]))
            })
            .collect()
    }

    pub fn scopes(&self) -> Vec<String> {
        self.params.scopes().map(str::to_string).collect()
    }
}
