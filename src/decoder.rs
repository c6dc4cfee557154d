// ============================================================================
// DECODER - code -> autoregressive steps -> tied-embedding word scores
// ============================================================================

use ndarray::{Array2, ArrayView2};

use crate::layers::{CellKind, Dense, Embedding, RecurrentCell};
use crate::params::ParamInit;
use crate::tensor::{argmax, Graph, TID};

pub struct Decoder {
    /// Start-of-sequence embedding; present only when previous tokens are fed back.
    go_token: Option<TID>,
    cell: RecurrentCell,
    output: Dense,
    hidden: usize,
    max_length: usize,
}

pub struct DecoderOutput {
    /// One `[batch, V]` node per step.
    pub logits: Vec<TID>,
    pub predictions: Array2<usize>,
}

/// Source of the previous-token embedding fed at steps after the first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeacherSignal {
    GroundTruth,
    OwnPrediction,
}

impl TeacherSignal {
    /// Evaluated on every call: labels only steer decoding on training passes.
    pub fn select(training: bool, has_labels: bool) -> Self {
        if training && has_labels { TeacherSignal::GroundTruth } else { TeacherSignal::OwnPrediction }
    }
}

impl Decoder {
    pub fn new(
        code_size: usize, embedding_dim: usize, max_length: usize,
        cell: CellKind, teacher_forcing: bool, init: &mut ParamInit,
    ) -> Self {
        let go_token = teacher_forcing
            .then(|| init.normal("go_token", 1, embedding_dim, (1.0 / embedding_dim as f32).sqrt()));
        let input = if teacher_forcing { code_size + embedding_dim } else { code_size };
        let cell = RecurrentCell::new(cell, input, code_size, init);
        let output = Dense::new(code_size, embedding_dim, &mut init.child("output"));
        Decoder { go_token, cell, output, hidden: code_size, max_length }
    }

    pub fn feeds_previous_token(&self) -> bool { self.go_token.is_some() }

    pub fn code_size(&self) -> usize { self.hidden }

    pub fn forward(
        &self, g: &mut Graph, embedding: &Embedding, code: TID,
        labels: Option<ArrayView2<usize>>, training: bool,
    ) -> DecoderOutput {
        self.forward_with_feedback(g, embedding, code, labels, training, |t| t)
    }

    /// `feedback` rewrites each predicted token before it is fed to the next step.
    pub(crate) fn forward_with_feedback(
        &self, g: &mut Graph, embedding: &Embedding, code: TID,
        labels: Option<ArrayView2<usize>>, training: bool, feedback: impl Fn(usize) -> usize,
    ) -> DecoderOutput {
        let batch = g.rows(code);
        let vocab = embedding.vocab_size;
        let signal = TeacherSignal::select(training, labels.is_some());
        let scores_t = embedding.transposed(g);

        let mut state = self.cell.zero_state(g, batch, self.hidden);
        let mut predictions = Array2::<usize>::zeros((batch, self.max_length));
        let mut logits = Vec::with_capacity(self.max_length);

        for i in 0..self.max_length {
            let x = if let Some(go_token) = self.go_token {
                let prev = if i == 0 {
                    g.gather_rows(go_token, &vec![0; batch])
                } else {
                    let ids: Vec<usize> = match (signal, labels) {
                        (TeacherSignal::GroundTruth, Some(l)) => l.column(i - 1).to_vec(),
                        _ => predictions.column(i - 1).iter().map(|&t| feedback(t)).collect(),
                    };
                    embedding.lookup(g, &ids)
                };
                g.concat_cols(code, prev)
            } else {
                code
            };

            state = self.cell.step(g, x, state);
            let proj = self.output.forward(g, state.h);
            let proj = g.tanh_op(proj);
            let step_logits = g.matmul(proj, scores_t);

            for (b, row) in g.data(step_logits).chunks(vocab).enumerate() {
                predictions[[b, i]] = argmax(row);
            }
            logits.push(step_logits);
        }
        DecoderOutput { logits, predictions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamStore, DECODER, EMBEDDINGS};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const VOCAB: usize = 7;

    struct Fixture {
        g: Graph,
        emb: Embedding,
        dec: Decoder,
    }

    fn fixture(teacher_forcing: bool) -> Fixture {
        let mut g = Graph::new();
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(21);
        let emb = Embedding::new(VOCAB, 4, &mut ParamInit::new(&mut g, &mut store, &mut rng, EMBEDDINGS));
        let dec = Decoder::new(3, 4, 4, CellKind::Gru, teacher_forcing,
            &mut ParamInit::new(&mut g, &mut store, &mut rng, DECODER));
        g.freeze_params();
        Fixture { g, emb, dec }
    }

    fn code(g: &mut Graph) -> TID {
        g.constant(vec![0.9, -0.4, 0.3, -0.7, 0.2, 0.8], 2, 3)
    }

    fn all_logits(g: &Graph, out: &DecoderOutput) -> Vec<f32> {
        out.logits.iter().flat_map(|&t| g.data(t).to_vec()).collect()
    }

    #[test]
    fn produces_one_score_row_per_step() {
        let mut f = fixture(true);
        let c = code(&mut f.g);
        let out = f.dec.forward(&mut f.g, &f.emb, c, None, false);
        assert_eq!(out.logits.len(), 4);
        assert_eq!(f.g.shape(out.logits[0]), (2, VOCAB));
        assert_eq!(out.predictions.dim(), (2, 4));
        assert!(out.predictions.iter().all(|&t| t < VOCAB));
    }

    #[test]
    fn signal_selection_is_a_runtime_choice() {
        assert_eq!(TeacherSignal::select(true, true), TeacherSignal::GroundTruth);
        assert_eq!(TeacherSignal::select(true, false), TeacherSignal::OwnPrediction);
        assert_eq!(TeacherSignal::select(false, true), TeacherSignal::OwnPrediction);
    }

    #[test]
    fn training_pass_ignores_the_prediction_path() {
        let labels = array![[1usize, 2, 3, 4], [5, 6, 0, 1]];
        let mut f = fixture(true);

        let c = code(&mut f.g);
        let clean = f.dec.forward(&mut f.g, &f.emb, c, Some(labels.view()), true);
        let clean = all_logits(&f.g, &clean);
        f.g.reset();

        let c = code(&mut f.g);
        let corrupted = f.dec.forward_with_feedback(
            &mut f.g, &f.emb, c, Some(labels.view()), true, |t| (t + 3) % VOCAB);
        assert_eq!(clean, all_logits(&f.g, &corrupted));
    }

    #[test]
    fn free_running_pass_follows_its_own_predictions() {
        let labels = array![[1usize, 2, 3, 4], [5, 6, 0, 1]];
        let mut f = fixture(true);

        let c = code(&mut f.g);
        let clean = f.dec.forward(&mut f.g, &f.emb, c, Some(labels.view()), false);
        let clean_logits = all_logits(&f.g, &clean);
        f.g.reset();

        let c = code(&mut f.g);
        let corrupted = f.dec.forward_with_feedback(
            &mut f.g, &f.emb, c, Some(labels.view()), false, |t| (t + 3) % VOCAB);
        let corrupted_logits = all_logits(&f.g, &corrupted);

        // Step 0 only sees the start token.
        let first = 2 * VOCAB;
        assert_eq!(clean_logits[..first], corrupted_logits[..first]);
        assert_ne!(clean_logits[first..], corrupted_logits[first..]);
    }

    #[test]
    fn start_token_exists_only_when_previous_tokens_are_fed() {
        let mut g = Graph::new();
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(3);
        let dec = Decoder::new(3, 4, 4, CellKind::Gru, false,
            &mut ParamInit::new(&mut g, &mut store, &mut rng, DECODER));
        assert!(!dec.feeds_previous_token());
        assert!(store.scope(DECODER).iter().all(|(name, _)| name != "go_token"));

        let f = fixture(true);
        assert!(f.dec.feeds_previous_token());
    }

    #[test]
    fn without_teacher_forcing_the_input_is_the_code_alone() {
        let labels = array![[1usize, 2, 3, 4], [5, 6, 0, 1]];
        let mut f = fixture(false);

        let c = code(&mut f.g);
        let forced = f.dec.forward(&mut f.g, &f.emb, c, Some(labels.view()), true);
        let forced = all_logits(&f.g, &forced);
        f.g.reset();

        let c = code(&mut f.g);
        let free = f.dec.forward(&mut f.g, &f.emb, c, None, false);
        assert_eq!(forced, all_logits(&f.g, &free));
    }
}
