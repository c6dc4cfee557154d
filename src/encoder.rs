// ============================================================================
// ENCODER - embedded tokens -> recurrent pass -> last output -> code
// ============================================================================

use ndarray::ArrayView2;
use rand::rngs::StdRng;

use crate::layers::{CellKind, Dense, Embedding, RecurrentCell};
use crate::params::{dropout_mask, rand_normal, ParamInit};
use crate::tensor::{Graph, TID};

/// Affine heads producing the Gaussian posterior of the code.
struct LatentHead {
    mean: Dense,
    log_std: Dense,
}

pub struct Encoder {
    cell: RecurrentCell,
    hidden: usize,
    reverse_input: bool,
    latent: Option<LatentHead>,
}

pub struct EncoderOutput {
    pub code: TID,
    pub mean: Option<TID>,
    pub log_std: Option<TID>,
}

impl EncoderOutput {
    pub fn posterior(&self) -> Option<(TID, TID)> {
        self.mean.zip(self.log_std)
    }
}

/// Multiplies by a fresh inverted-dropout mask. Identity when `keep_prob >= 1`.
pub(crate) fn dropout(g: &mut Graph, x: TID, keep_prob: f32, rng: &mut StdRng) -> TID {
    if keep_prob >= 1.0 { return x; }
    let (rows, cols) = g.shape(x);
    let mask = g.constant(dropout_mask(rows * cols, keep_prob, rng), rows, cols);
    g.mul(x, mask)
}

impl Encoder {
    pub fn new(
        embedding_dim: usize, hidden: usize, cell: CellKind,
        variational: bool, reverse_input: bool, init: &mut ParamInit,
    ) -> Self {
        let cell = RecurrentCell::new(cell, embedding_dim, hidden, init);
        let latent = if variational {
            let mean = Dense::new(hidden, hidden, &mut init.child("latent_mean"));
            let log_std = Dense::new(hidden, hidden, &mut init.child("latent_log_std"));
            Some(LatentHead { mean, log_std })
        } else {
            None
        };
        Encoder { cell, hidden, reverse_input, latent }
    }

    pub fn hidden_size(&self) -> usize { self.hidden }

    pub fn is_variational(&self) -> bool { self.latent.is_some() }

    /// Runs one batch from a zero state. `sample` draws epsilon for the variational code;
    /// without it the code is the posterior mean.
    pub fn forward(
        &self, g: &mut Graph, embedding: &Embedding, tokens: ArrayView2<usize>,
        keep_prob: f32, sample: bool, rng: &mut StdRng,
    ) -> EncoderOutput {
        let (batch, len) = tokens.dim();
        let mut state = self.cell.zero_state(g, batch, self.hidden);
        for t in 0..len {
            let col = if self.reverse_input { len - 1 - t } else { t };
            let ids: Vec<usize> = tokens.column(col).to_vec();
            let x = embedding.lookup(g, &ids);
            let x = dropout(g, x, keep_prob, rng);
            state = self.cell.step(g, x, state);
        }
        let last = dropout(g, state.h, keep_prob, rng);

        let Some(head) = &self.latent else {
            return EncoderOutput { code: last, mean: None, log_std: None };
        };
        let mean = head.mean.forward(g, last);
        let log_std = head.log_std.forward(g, last);
        let code = if sample {
            // mean + exp(log_std) * eps
            let eps = g.constant(rand_normal(batch * self.hidden, 1.0, rng), batch, self.hidden);
            let std = g.exp_op(log_std);
            let noise = g.mul(std, eps);
            g.add(mean, noise)
        } else {
            mean
        };
        EncoderOutput { code, mean: Some(mean), log_std: Some(log_std) }
    }
}
