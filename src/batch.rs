// ============================================================================
// BATCH GENERATOR - consecutive slices along the leading axis, partial tail kept
// ============================================================================

use std::ops::Range;

use ndarray::{ArrayView, Axis, RemoveAxis, Slice};

use crate::error::ShapeError;

/// Anything that can be cut into contiguous example ranges along its first axis.
/// Tuples batch their members in lockstep and must agree on length.
pub trait Batchable {
    type Batch;

    fn num_examples(&self) -> Result<usize, ShapeError>;

    fn slice_batch(&self, range: Range<usize>) -> Self::Batch;
}

impl<'a, A, D: RemoveAxis> Batchable for ArrayView<'a, A, D> {
    type Batch = ArrayView<'a, A, D>;

    fn num_examples(&self) -> Result<usize, ShapeError> {
        Ok(self.len_of(Axis(0)))
    }

    fn slice_batch(&self, range: Range<usize>) -> Self::Batch {
        let mut view = self.clone();
        view.slice_axis_inplace(Axis(0), Slice::from(range));
        view
    }
}

impl<'a, T> Batchable for &'a [T] {
    type Batch = &'a [T];

    fn num_examples(&self) -> Result<usize, ShapeError> {
        Ok(self.len())
    }

    fn slice_batch(&self, range: Range<usize>) -> Self::Batch {
        &self[range]
    }
}

fn agree(first: usize, other: usize) -> Result<usize, ShapeError> {
    if first == other { Ok(first) } else { Err(ShapeError::LeadingDimMismatch { first, other }) }
}

impl<A: Batchable, B: Batchable> Batchable for (A, B) {
    type Batch = (A::Batch, B::Batch);

    fn num_examples(&self) -> Result<usize, ShapeError> {
        agree(self.0.num_examples()?, self.1.num_examples()?)
    }

    fn slice_batch(&self, range: Range<usize>) -> Self::Batch {
        (self.0.slice_batch(range.clone()), self.1.slice_batch(range))
    }
}

impl<A: Batchable, B: Batchable, C: Batchable> Batchable for (A, B, C) {
    type Batch = (A::Batch, B::Batch, C::Batch);

    fn num_examples(&self) -> Result<usize, ShapeError> {
        let n = agree(self.0.num_examples()?, self.1.num_examples()?)?;
        agree(n, self.2.num_examples()?)
    }

    fn slice_batch(&self, range: Range<usize>) -> Self::Batch {
        (
            self.0.slice_batch(range.clone()),
            self.1.slice_batch(range.clone()),
            self.2.slice_batch(range),
        )
    }
}

/// One pass over a dataset. Build a fresh generator for every pass.
pub struct BatchGenerator<S> {
    source: S,
    batch_size: usize,
    total: usize,
    cursor: usize,
}

impl<S: Batchable> BatchGenerator<S> {
    pub fn new(source: S, batch_size: usize) -> Result<Self, ShapeError> {
        if batch_size == 0 {
            return Err(ShapeError::ZeroBatchSize);
        }
        let total = source.num_examples()?;
        Ok(BatchGenerator { source, batch_size, total, cursor: 0 })
    }

    /// `batch_size` of `None` means the whole dataset in one batch.
    pub fn with_optional_size(source: S, batch_size: Option<usize>) -> Result<Self, ShapeError> {
        let size = match batch_size {
            Some(b) => b,
            None => source.num_examples()?.max(1),
        };
        Self::new(source, size)
    }

    pub fn num_examples(&self) -> usize { self.total }

    pub fn num_batches(&self) -> usize { self.total.div_ceil(self.batch_size) }
}

impl<S: Batchable> Iterator for BatchGenerator<S> {
    type Item = S::Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.total {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.total);
        let batch = self.source.slice_batch(self.cursor..end);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.cursor).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl<S: Batchable> ExactSizeIterator for BatchGenerator<S> {}
