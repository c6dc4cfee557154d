// ============================================================================
// VECTORIZED TENSOR AUTODIFF ENGINE
// Each node = dense row-major matrix, batch on the row axis. Parameters live in
// a frozen prefix of the tape; everything after it is scratch for one pass.
// ============================================================================

use rayon::prelude::*;

#[inline]
pub(crate) fn vec_add_inplace(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter_mut().zip(b.iter()) { *x += y; }
}

#[inline]
pub(crate) fn vec_scale_inplace(a: &mut [f32], s: f32) {
    for x in a.iter_mut() { *x *= s; }
}

#[inline]
pub(crate) fn vec_max(a: &[f32]) -> f32 {
    a.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

/// Index of the largest entry; ties resolve to the lowest index.
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (j, &v) in row.iter().enumerate() {
        if v > row[best] { best = j; }
    }
    best
}

/// Row-wise softmax of a `[rows, cols]` buffer.
pub fn softmax_rows(data: &[f32], cols: usize) -> Vec<f32> {
    let mut out = data.to_vec();
    if cols == 0 { return out; }
    out.par_chunks_mut(cols).for_each(|row| {
        let mx = vec_max(row);
        let mut sum = 0.0f32;
        for v in row.iter_mut() { *v = (*v - mx).exp(); sum += *v; }
        for v in row.iter_mut() { *v /= sum; }
    });
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TID(pub(crate) usize);

#[derive(Clone, Debug)]
enum TensorOp {
    None,
    MatMul { a: TID, b: TID, m: usize, k: usize, n: usize },
    Add { a: TID, b: TID },
    Sub { a: TID, b: TID },
    Mul { a: TID, b: TID },
    Scale { a: TID, s: f32 },
    AddScalar { a: TID },
    Sigmoid { a: TID },
    Tanh { a: TID },
    Exp { a: TID },
    Square { a: TID },
    OneMinus { a: TID },
    BroadcastAdd { a: TID, bias: TID, rows: usize, cols: usize },
    Transpose { a: TID, rows: usize, cols: usize },
    GatherRows { table: TID, indices: Vec<usize>, cols: usize },
    ConcatCols { a: TID, b: TID, rows: usize, ca: usize, cb: usize },
    MeanAll { a: TID },
    SoftmaxCE { logits: TID, targets: Vec<usize>, rows: usize, vocab: usize },
}

struct TensorNode {
    data: Vec<f32>,
    grad: Vec<f32>,
    rows: usize,
    cols: usize,
    op: TensorOp,
}

pub struct Graph {
    nodes: Vec<TensorNode>,
    param_boundary: usize,
}

impl Default for Graph {
    fn default() -> Self { Self::new() }
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::with_capacity(4096), param_boundary: 0 }
    }

    fn push(&mut self, data: Vec<f32>, rows: usize, cols: usize, op: TensorOp) -> TID {
        debug_assert_eq!(data.len(), rows * cols);
        let len = data.len();
        let id = self.nodes.len();
        self.nodes.push(TensorNode { data, grad: vec![0.0; len], rows, cols, op });
        TID(id)
    }

    /// Leaf node that survives `reset`. Must be created before `freeze_params`.
    pub fn param(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        debug_assert_eq!(self.param_boundary, 0, "params must be created before freeze_params");
        self.push(data, rows, cols, TensorOp::None)
    }

    pub fn constant(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        self.push(data, rows, cols, TensorOp::None)
    }

    pub fn freeze_params(&mut self) { self.param_boundary = self.nodes.len(); }

    pub fn reset(&mut self) { self.nodes.truncate(self.param_boundary); }

    pub fn zero_grad(&mut self) {
        for node in self.nodes.iter_mut() {
            for g in node.grad.iter_mut() { *g = 0.0; }
        }
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn data(&self, t: TID) -> &[f32] { &self.nodes[t.0].data }
    pub fn data_mut(&mut self, t: TID) -> &mut [f32] { &mut self.nodes[t.0].data }
    pub fn grad(&self, t: TID) -> &[f32] { &self.nodes[t.0].grad }
    pub fn grad_mut(&mut self, t: TID) -> &mut [f32] { &mut self.nodes[t.0].grad }
    pub fn rows(&self, t: TID) -> usize { self.nodes[t.0].rows }
    pub fn cols(&self, t: TID) -> usize { self.nodes[t.0].cols }
    pub fn shape(&self, t: TID) -> (usize, usize) { (self.nodes[t.0].rows, self.nodes[t.0].cols) }

    /// Parameter data and grad borrowed together, for optimizer updates.
    pub(crate) fn param_slots(&mut self, t: TID) -> (&mut [f32], &[f32]) {
        let node = &mut self.nodes[t.0];
        (&mut node.data, &node.grad)
    }

    fn unary(&mut self, a: TID, f: impl Fn(f32) -> f32, op: TensorOp) -> TID {
        let data: Vec<f32> = self.nodes[a.0].data.iter().map(|&x| f(x)).collect();
        let (r, c) = self.shape(a);
        self.push(data, r, c, op)
    }

    fn binary(&mut self, a: TID, b: TID, f: impl Fn(f32, f32) -> f32, op: TensorOp) -> TID {
        debug_assert_eq!(self.shape(a), self.shape(b), "elementwise shape mismatch");
        let data: Vec<f32> = self.nodes[a.0].data.iter()
            .zip(self.nodes[b.0].data.iter())
            .map(|(&x, &y)| f(x, y))
            .collect();
        let (r, c) = self.shape(a);
        self.push(data, r, c, op)
    }

    // ------------------------------------------------------------------
    // Forward ops - each builds one TensorNode
    // ------------------------------------------------------------------

    pub fn matmul(&mut self, a: TID, b: TID) -> TID {
        let (m, k) = self.shape(a);
        let n = self.nodes[b.0].cols;
        debug_assert_eq!(k, self.nodes[b.0].rows, "matmul shape [{},{}] @ [{},{}]",
            m, k, self.nodes[b.0].rows, n);

        let a_data = &self.nodes[a.0].data;
        let b_data = &self.nodes[b.0].data;
        let mut out = vec![0.0f32; m * n];
        // SAFETY: buffers are sized [m,k], [k,n], [m,n] and strides describe row-major layouts.
        unsafe {
            matrixmultiply::sgemm(
                m, k, n,
                1.0,
                a_data.as_ptr(), k as isize, 1,
                b_data.as_ptr(), n as isize, 1,
                0.0,
                out.as_mut_ptr(), n as isize, 1,
            );
        }
        self.push(out, m, n, TensorOp::MatMul { a, b, m, k, n })
    }

    pub fn add(&mut self, a: TID, b: TID) -> TID {
        self.binary(a, b, |x, y| x + y, TensorOp::Add { a, b })
    }

    pub fn sub(&mut self, a: TID, b: TID) -> TID {
        self.binary(a, b, |x, y| x - y, TensorOp::Sub { a, b })
    }

    pub fn mul(&mut self, a: TID, b: TID) -> TID {
        self.binary(a, b, |x, y| x * y, TensorOp::Mul { a, b })
    }

    pub fn scale(&mut self, a: TID, s: f32) -> TID {
        self.unary(a, |x| x * s, TensorOp::Scale { a, s })
    }

    pub fn add_scalar(&mut self, a: TID, s: f32) -> TID {
        self.unary(a, |x| x + s, TensorOp::AddScalar { a })
    }

    pub fn sigmoid(&mut self, a: TID) -> TID {
        self.unary(a, |x| 1.0 / (1.0 + (-x).exp()), TensorOp::Sigmoid { a })
    }

    pub fn tanh_op(&mut self, a: TID) -> TID {
        self.unary(a, f32::tanh, TensorOp::Tanh { a })
    }

    pub fn exp_op(&mut self, a: TID) -> TID {
        self.unary(a, f32::exp, TensorOp::Exp { a })
    }

    pub fn square(&mut self, a: TID) -> TID {
        self.unary(a, |x| x * x, TensorOp::Square { a })
    }

    pub fn one_minus(&mut self, a: TID) -> TID {
        self.unary(a, |x| 1.0 - x, TensorOp::OneMinus { a })
    }

    /// [m,n] + [1,n] broadcast bias add
    pub fn broadcast_add(&mut self, a: TID, bias: TID) -> TID {
        let (rows, cols) = self.shape(a);
        debug_assert_eq!(self.shape(bias), (1, cols));
        let mut out = self.nodes[a.0].data.clone();
        let bd = &self.nodes[bias.0].data;
        for row in out.chunks_mut(cols.max(1)) { vec_add_inplace(row, bd); }
        self.push(out, rows, cols, TensorOp::BroadcastAdd { a, bias, rows, cols })
    }

    pub fn transpose(&mut self, a: TID) -> TID {
        let (rows, cols) = self.shape(a);
        let ad = &self.nodes[a.0].data;
        let mut out = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols { out[j * rows + i] = ad[i * cols + j]; }
        }
        self.push(out, cols, rows, TensorOp::Transpose { a, rows, cols })
    }

    /// Row lookup: `[V, C]` table, one index per output row -> `[indices.len(), C]`.
    pub fn gather_rows(&mut self, table: TID, indices: &[usize]) -> TID {
        let (vocab, cols) = self.shape(table);
        let td = &self.nodes[table.0].data;
        let mut out = Vec::with_capacity(indices.len() * cols);
        for &idx in indices {
            debug_assert!(idx < vocab, "row {} out of range for table of {}", idx, vocab);
            out.extend_from_slice(&td[idx * cols..(idx + 1) * cols]);
        }
        let rows = indices.len();
        self.push(out, rows, cols, TensorOp::GatherRows { table, indices: indices.to_vec(), cols })
    }

    /// `[m, ca]` ++ `[m, cb]` -> `[m, ca + cb]`
    pub fn concat_cols(&mut self, a: TID, b: TID) -> TID {
        let (rows, ca) = self.shape(a);
        let (rb, cb) = self.shape(b);
        debug_assert_eq!(rows, rb, "concat_cols row mismatch");
        let ad = &self.nodes[a.0].data;
        let bd = &self.nodes[b.0].data;
        let mut out = Vec::with_capacity(rows * (ca + cb));
        for i in 0..rows {
            out.extend_from_slice(&ad[i * ca..(i + 1) * ca]);
            out.extend_from_slice(&bd[i * cb..(i + 1) * cb]);
        }
        self.push(out, rows, ca + cb, TensorOp::ConcatCols { a, b, rows, ca, cb })
    }

    pub fn mean_all(&mut self, a: TID) -> TID {
        let ad = &self.nodes[a.0].data;
        let mean = if ad.is_empty() { 0.0 } else { ad.iter().sum::<f32>() / ad.len() as f32 };
        self.push(vec![mean], 1, 1, TensorOp::MeanAll { a })
    }

    /// Fused softmax cross-entropy summed over rows: `[rows, vocab]` + one target per row -> scalar.
    pub fn softmax_ce(&mut self, logits: TID, targets: &[usize]) -> TID {
        let (rows, vocab) = self.shape(logits);
        debug_assert_eq!(rows, targets.len());
        let ld = &self.nodes[logits.0].data;
        let mut loss = 0.0f32;
        for (row, &target) in ld.chunks(vocab).zip(targets.iter()) {
            let max_l = vec_max(row);
            let sum_exp: f32 = row.iter().map(|&x| (x - max_l).exp()).sum();
            loss += sum_exp.ln() + max_l - row[target];
        }
        self.push(vec![loss], 1, 1, TensorOp::SoftmaxCE { logits, targets: targets.to_vec(), rows, vocab })
    }

    // ------------------------------------------------------------------
    // Backward - vectorized gradient propagation
    // ------------------------------------------------------------------

    pub fn backward(&mut self, loss: TID) {
        debug_assert_eq!(self.shape(loss), (1, 1), "backward needs a scalar");
        self.nodes[loss.0].grad = vec![1.0];

        for i in (0..=loss.0).rev() {
            let has_grad = self.nodes[i].grad.iter().any(|&g| g != 0.0);
            if !has_grad { continue; }

            let op = self.nodes[i].op.clone();
            match op {
                TensorOp::None => {}

                TensorOp::MatMul { a, b, m, k, n: nn } => {
                    let og = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    // dA = dOut @ B^T
                    let mut da_buf = vec![0.0f32; m * k];
                    // SAFETY: B^T read from B[k,nn] with swapped strides; all buffers sized to match.
                    unsafe {
                        matrixmultiply::sgemm(
                            m, nn, k,
                            1.0,
                            og.as_ptr(), nn as isize, 1,
                            b_d.as_ptr(), 1, nn as isize,
                            0.0,
                            da_buf.as_mut_ptr(), k as isize, 1,
                        );
                    }
                    vec_add_inplace(&mut self.nodes[a.0].grad, &da_buf);
                    // dB = A^T @ dOut
                    let mut db_buf = vec![0.0f32; k * nn];
                    // SAFETY: A^T read from A[m,k] with swapped strides.
                    unsafe {
                        matrixmultiply::sgemm(
                            k, m, nn,
                            1.0,
                            a_d.as_ptr(), 1, k as isize,
                            og.as_ptr(), nn as isize, 1,
                            0.0,
                            db_buf.as_mut_ptr(), nn as isize, 1,
                        );
                    }
                    vec_add_inplace(&mut self.nodes[b.0].grad, &db_buf);
                }

                TensorOp::Add { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    vec_add_inplace(&mut self.nodes[b.0].grad, &g);
                }

                TensorOp::Sub { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for (bg, &og) in self.nodes[b.0].grad.iter_mut().zip(g.iter()) { *bg -= og; }
                }

                TensorOp::Mul { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    for j in 0..g.len() {
                        self.nodes[a.0].grad[j] += g[j] * b_d[j];
                        self.nodes[b.0].grad[j] += g[j] * a_d[j];
                    }
                }

                TensorOp::Scale { a, s } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * s; }
                }

                TensorOp::AddScalar { a } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                }

                TensorOp::Sigmoid { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let s = od[j];
                        self.nodes[a.0].grad[j] += g[j] * s * (1.0 - s);
                    }
                }

                TensorOp::Tanh { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let t = od[j];
                        self.nodes[a.0].grad[j] += g[j] * (1.0 - t * t);
                    }
                }

                TensorOp::Exp { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * od[j]; }
                }

                TensorOp::Square { a } => {
                    let g = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * 2.0 * a_d[j]; }
                }

                TensorOp::OneMinus { a } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] -= g[j]; }
                }

                TensorOp::BroadcastAdd { a, bias, rows, cols } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for ii in 0..rows {
                        let off = ii * cols;
                        for j in 0..cols { self.nodes[bias.0].grad[j] += g[off + j]; }
                    }
                }

                TensorOp::Transpose { a, rows, cols } => {
                    let g = self.nodes[i].grad.clone();
                    for ii in 0..cols {
                        for jj in 0..rows {
                            self.nodes[a.0].grad[jj * cols + ii] += g[ii * rows + jj];
                        }
                    }
                }

                TensorOp::GatherRows { table, indices, cols } => {
                    let g = self.nodes[i].grad.clone();
                    for (r, &idx) in indices.iter().enumerate() {
                        let dst = &mut self.nodes[table.0].grad[idx * cols..(idx + 1) * cols];
                        vec_add_inplace(dst, &g[r * cols..(r + 1) * cols]);
                    }
                }

                TensorOp::ConcatCols { a, b, rows, ca, cb } => {
                    let g = self.nodes[i].grad.clone();
                    let width = ca + cb;
                    for r in 0..rows {
                        let row = &g[r * width..(r + 1) * width];
                        vec_add_inplace(&mut self.nodes[a.0].grad[r * ca..(r + 1) * ca], &row[..ca]);
                        vec_add_inplace(&mut self.nodes[b.0].grad[r * cb..(r + 1) * cb], &row[ca..]);
                    }
                }

                TensorOp::MeanAll { a } => {
                    let len = self.nodes[a.0].grad.len();
                    if len == 0 { continue; }
                    let gv = self.nodes[i].grad[0] / len as f32;
                    for v in self.nodes[a.0].grad.iter_mut() { *v += gv; }
                }

                TensorOp::SoftmaxCE { logits, targets, rows, vocab } => {
                    let gv = self.nodes[i].grad[0];
                    let ld = self.nodes[logits.0].data.clone();
                    let probs = softmax_rows(&ld, vocab);
                    let lg = &mut self.nodes[logits.0].grad;
                    for r in 0..rows {
                        let off = r * vocab;
                        for j in 0..vocab {
                            let tg = if j == targets[r] { probs[off + j] - 1.0 } else { probs[off + j] };
                            lg[off + j] += gv * tg;
                        }
                    }
                }
            }
        }
    }
}
