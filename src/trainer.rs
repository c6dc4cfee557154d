// ============================================================================
// TRAINER - loss composition, KL annealing, Adam, gradient clipping
// ============================================================================

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::tensor::{vec_scale_inplace, Graph, TID};

/// Linear KL-weight ramp: `min(start + increase * epoch, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KlSchedule {
    pub start: f32,
    pub increase: f32,
    pub max: f32,
}

impl Default for KlSchedule {
    fn default() -> Self {
        KlSchedule { start: 0.0, increase: 0.1, max: 1.0 }
    }
}

impl KlSchedule {
    pub fn constant(weight: f32) -> Self {
        KlSchedule { start: weight, increase: 0.0, max: weight }
    }

    pub fn weight(&self, epoch: usize) -> f32 {
        (self.start + self.increase * epoch as f32).min(self.max)
    }
}

/// Scalar nodes making up one batch objective.
pub struct LossTerms {
    pub total: TID,
    pub reconstruction: TID,
    pub kl_divergence: Option<TID>,
}

/// Mean token cross-entropy over `[batch, L]` labels plus `kl_weight` times the
/// Gaussian KL to N(0, I) when a posterior is given.
pub fn compose_loss(
    g: &mut Graph, logits: &[TID], labels: ArrayView2<usize>,
    posterior: Option<(TID, TID)>, kl_weight: f32,
) -> LossTerms {
    let (batch, len) = labels.dim();
    let mut summed: Option<TID> = None;
    for (i, &step) in logits.iter().enumerate() {
        let targets: Vec<usize> = labels.column(i).to_vec();
        let ce = g.softmax_ce(step, &targets);
        summed = Some(match summed {
            Some(acc) => g.add(acc, ce),
            None => ce,
        });
    }
    let reconstruction = match summed {
        Some(s) => g.scale(s, 1.0 / (batch * len).max(1) as f32),
        None => g.constant(vec![0.0], 1, 1),
    };

    let Some((mean, log_std)) = posterior else {
        return LossTerms { total: reconstruction, reconstruction, kl_divergence: None };
    };
    let kl = gaussian_kl(g, mean, log_std);
    let weighted = g.scale(kl, kl_weight);
    let total = g.add(reconstruction, weighted);
    LossTerms { total, reconstruction, kl_divergence: Some(kl) }
}

/// Element-mean of `0.5 * (mean^2 + exp(2 log_std) - 1 - 2 log_std)`; never negative.
pub fn gaussian_kl(g: &mut Graph, mean: TID, log_std: TID) -> TID {
    let mu2 = g.square(mean);
    let two_ls = g.scale(log_std, 2.0);
    let var = g.exp_op(two_ls);
    let s = g.add(mu2, var);
    let s = g.sub(s, two_ls);
    let s = g.add_scalar(s, -1.0);
    let m = g.mean_all(s);
    g.scale(m, 0.5)
}

/// Rescales gradients to `max_norm` when their global norm exceeds it. Returns the norm before clipping.
pub fn clip_grad(g: &mut Graph, ids: &[TID], max_norm: f32) -> f32 {
    let norm = grad_norm(g, ids);
    if norm > max_norm {
        let s = max_norm / norm;
        for &t in ids { vec_scale_inplace(g.grad_mut(t), s); }
    }
    norm
}

pub fn grad_norm(g: &Graph, ids: &[TID]) -> f32 {
    ids.iter()
        .flat_map(|&t| g.grad(t).iter())
        .map(|&v| v * v)
        .sum::<f32>()
        .sqrt()
}

// ============================================================================
// ADAM - decoupled weight decay, moments kept per parameter
// ============================================================================

pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    t: usize,
    ids: Vec<TID>,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(lr: f32, weight_decay: f32, ids: Vec<TID>, g: &Graph) -> Self {
        let m = ids.iter().map(|&t| vec![0.0; g.data(t).len()]).collect();
        let v = ids.iter().map(|&t| vec![0.0; g.data(t).len()]).collect();
        Adam { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay, t: 0, ids, m, v }
    }

    pub fn ids(&self) -> &[TID] { &self.ids }

    pub fn steps_taken(&self) -> usize { self.t }

    pub fn step(&mut self, g: &mut Graph) {
        self.t += 1;
        let t = self.t as f32;
        let bc1 = 1.0 - self.beta1.powf(t);
        let bc2 = 1.0 - self.beta2.powf(t);

        for (idx, &tid) in self.ids.iter().enumerate() {
            let (data, grad) = g.param_slots(tid);
            let pm = &mut self.m[idx];
            let pv = &mut self.v[idx];
            for j in 0..data.len() {
                let gj = grad[j];
                if gj == 0.0 && pm[j] == 0.0 { continue; }
                pm[j] = self.beta1 * pm[j] + (1.0 - self.beta1) * gj;
                pv[j] = self.beta2 * pv[j] + (1.0 - self.beta2) * gj * gj;
                let m_hat = pm[j] / bc1;
                let v_hat = pv[j] / bc2;
                data[j] -= self.lr * self.weight_decay * data[j] + self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

/// Owns the optimizer; the only writer of parameter values.
pub struct Trainer {
    optimizer: Adam,
    max_grad_norm: Option<f32>,
}

impl Trainer {
    pub fn new(lr: f32, weight_decay: f32, max_grad_norm: Option<f32>, ids: Vec<TID>, g: &Graph) -> Self {
        Trainer { optimizer: Adam::new(lr, weight_decay, ids, g), max_grad_norm }
    }

    /// Backpropagates `loss` and applies one update. Returns the pre-clip gradient norm.
    pub fn update(&mut self, g: &mut Graph, loss: TID) -> f32 {
        g.zero_grad();
        g.backward(loss);
        let norm = match self.max_grad_norm {
            Some(max) => clip_grad(g, self.optimizer.ids(), max),
            None => grad_norm(g, self.optimizer.ids()),
        };
        self.optimizer.step(g);
        norm
    }

    pub fn steps_taken(&self) -> usize { self.optimizer.steps_taken() }
}
