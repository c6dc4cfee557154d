// ============================================================================
// LAYERS - embedding table, dense projection, recurrent cells
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::params::ParamInit;
use crate::tensor::{Graph, TID};

/// Shared `[V, E]` table used for input lookup and tied output scoring.
pub struct Embedding {
    pub table: TID,
    pub vocab_size: usize,
    pub dim: usize,
}

impl Embedding {
    pub fn new(vocab_size: usize, dim: usize, init: &mut ParamInit) -> Self {
        let scale = (1.0 / dim as f32).sqrt();
        let table = init.normal("table", vocab_size, dim, scale);
        Embedding { table, vocab_size, dim }
    }

    /// `[tokens.len(), E]`
    pub fn lookup(&self, g: &mut Graph, tokens: &[usize]) -> TID {
        g.gather_rows(self.table, tokens)
    }

    /// `[E, V]` view for dot-product scoring; build once per pass.
    pub fn transposed(&self, g: &mut Graph) -> TID {
        g.transpose(self.table)
    }
}

pub struct Dense {
    pub w: TID,
    pub b: TID,
}

impl Dense {
    pub fn new(input: usize, output: usize, init: &mut ParamInit) -> Self {
        let scale = (2.0 / (input + output) as f32).sqrt();
        let w = init.normal("w", input, output, scale);
        let b = init.zeros("b", 1, output);
        Dense { w, b }
    }

    pub fn forward(&self, g: &mut Graph, x: TID) -> TID {
        let xw = g.matmul(x, self.w);
        g.broadcast_add(xw, self.b)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Gru,
    Lstm,
}

/// Recurrent state carried across steps of one call. `c` is only set for LSTM.
#[derive(Clone, Copy, Debug)]
pub struct CellState {
    pub h: TID,
    pub c: Option<TID>,
}

/// One gate: `x @ W + h @ U + b`
struct Gate { w: TID, u: TID, b: TID }

impl Gate {
    fn new(name: &str, input: usize, hidden: usize, bias: f32, init: &mut ParamInit) -> Self {
        let si = (2.0 / (input + hidden) as f32).sqrt();
        let sh = (1.0 / hidden as f32).sqrt();
        let mut p = init.child(name);
        let w = p.normal("w", input, hidden, si);
        let u = p.normal("u", hidden, hidden, sh);
        let b = p.full("b", 1, hidden, bias);
        Gate { w, u, b }
    }

    fn pre(&self, g: &mut Graph, x: TID, h: TID) -> TID {
        let wx = g.matmul(x, self.w);
        let uh = g.matmul(h, self.u);
        let s = g.add(wx, uh);
        g.broadcast_add(s, self.b)
    }
}

pub struct GruCell {
    z: Gate,
    r: Gate,
    cand: Gate,
}

impl GruCell {
    pub fn new(input: usize, hidden: usize, init: &mut ParamInit) -> Self {
        GruCell {
            z: Gate::new("update", input, hidden, 0.0, init),
            r: Gate::new("reset", input, hidden, 0.0, init),
            cand: Gate::new("candidate", input, hidden, 0.0, init),
        }
    }

    pub fn step(&self, g: &mut Graph, x: TID, h_prev: TID) -> TID {
        // z = sigmoid(x @ Wz + h @ Uz + bz)
        let z_pre = self.z.pre(g, x, h_prev);
        let z = g.sigmoid(z_pre);
        // r = sigmoid(x @ Wr + h @ Ur + br)
        let r_pre = self.r.pre(g, x, h_prev);
        let r = g.sigmoid(r_pre);
        // h_cand = tanh(x @ Wh + (r*h) @ Uh + bh)
        let rh = g.mul(r, h_prev);
        let c_pre = self.cand.pre(g, x, rh);
        let h_cand = g.tanh_op(c_pre);
        // h = (1-z)*h_prev + z*h_cand
        let one_minus_z = g.one_minus(z);
        let keep = g.mul(one_minus_z, h_prev);
        let update = g.mul(z, h_cand);
        g.add(keep, update)
    }
}

pub struct LstmCell {
    input_gate: Gate,
    forget_gate: Gate,
    output_gate: Gate,
    cand: Gate,
}

impl LstmCell {
    pub fn new(input: usize, hidden: usize, init: &mut ParamInit) -> Self {
        LstmCell {
            input_gate: Gate::new("input", input, hidden, 0.0, init),
            forget_gate: Gate::new("forget", input, hidden, 1.0, init),
            output_gate: Gate::new("output", input, hidden, 0.0, init),
            cand: Gate::new("candidate", input, hidden, 0.0, init),
        }
    }

    pub fn step(&self, g: &mut Graph, x: TID, h_prev: TID, c_prev: TID) -> (TID, TID) {
        let i_pre = self.input_gate.pre(g, x, h_prev);
        let i = g.sigmoid(i_pre);
        let f_pre = self.forget_gate.pre(g, x, h_prev);
        let f = g.sigmoid(f_pre);
        let o_pre = self.output_gate.pre(g, x, h_prev);
        let o = g.sigmoid(o_pre);
        let c_pre = self.cand.pre(g, x, h_prev);
        let c_cand = g.tanh_op(c_pre);
        // c = f*c_prev + i*c_cand ; h = o*tanh(c)
        let fc = g.mul(f, c_prev);
        let ic = g.mul(i, c_cand);
        let c = g.add(fc, ic);
        let c_act = g.tanh_op(c);
        let h = g.mul(o, c_act);
        (h, c)
    }
}

pub enum RecurrentCell {
    Gru(GruCell),
    Lstm(LstmCell),
}

impl RecurrentCell {
    pub fn new(kind: CellKind, input: usize, hidden: usize, init: &mut ParamInit) -> Self {
        let mut p = init.child("cell");
        match kind {
            CellKind::Gru => RecurrentCell::Gru(GruCell::new(input, hidden, &mut p)),
            CellKind::Lstm => RecurrentCell::Lstm(LstmCell::new(input, hidden, &mut p)),
        }
    }

    pub fn zero_state(&self, g: &mut Graph, batch: usize, hidden: usize) -> CellState {
        let h = g.constant(vec![0.0; batch * hidden], batch, hidden);
        let c = match self {
            RecurrentCell::Gru(_) => None,
            RecurrentCell::Lstm(_) => Some(g.constant(vec![0.0; batch * hidden], batch, hidden)),
        };
        CellState { h, c }
    }

    /// Advances one step; the step output is the new `h`.
    pub fn step(&self, g: &mut Graph, x: TID, state: CellState) -> CellState {
        match self {
            RecurrentCell::Gru(cell) => CellState { h: cell.step(g, x, state.h), c: None },
            RecurrentCell::Lstm(cell) => {
                let c_prev = match state.c {
                    Some(c) => c,
                    None => {
                        let (rows, cols) = g.shape(state.h);
                        g.constant(vec![0.0; rows * cols], rows, cols)
                    }
                };
                let (h, c) = cell.step(g, x, state.h, c_prev);
                CellState { h, c: Some(c) }
            }
        }
    }
}
