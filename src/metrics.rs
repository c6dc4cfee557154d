//! Reconstruction accuracy over `(N, L)` token arrays.

use ndarray::ArrayView2;

use crate::error::ShapeError;

fn check(predicted: &ArrayView2<usize>, target: &ArrayView2<usize>) -> Result<(), ShapeError> {
    let (pn, pl) = predicted.dim();
    let (tn, tl) = target.dim();
    if pn != tn {
        return Err(ShapeError::LeadingDimMismatch { first: pn, other: tn });
    }
    if pl != tl {
        return Err(ShapeError::WidthMismatch { expected: tl, actual: pl });
    }
    Ok(())
}

/// Fraction of rows reproduced exactly. 0 for an empty set.
pub fn exact_match_accuracy(predicted: ArrayView2<usize>, target: ArrayView2<usize>) -> Result<f32, ShapeError> {
    check(&predicted, &target)?;
    let n = predicted.nrows();
    if n == 0 { return Ok(0.0); }
    let hits = predicted.outer_iter().zip(target.outer_iter()).filter(|(p, t)| p == t).count();
    Ok(hits as f32 / n as f32)
}

/// Fraction of positions whose token matches.
pub fn token_accuracy(predicted: ArrayView2<usize>, target: ArrayView2<usize>) -> Result<f32, ShapeError> {
    check(&predicted, &target)?;
    let total = predicted.len();
    if total == 0 { return Ok(0.0); }
    let hits = predicted.iter().zip(target.iter()).filter(|(p, t)| p == t).count();
    Ok(hits as f32 / total as f32)
}
